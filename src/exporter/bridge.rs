use log::{debug, error};

use super::span::{require_id, EmitOptions, EntityTiming, PipelineRef};
use super::summary::{EntityOutcome, EntityStats};
use crate::attributes::FlatAttributeMap;
use crate::error::Result;
use crate::providers::{DownstreamRef, ExecutionRecord};
use crate::telemetry::{SpanContext, SpanKind, SpanStatus, Telemetry};

/// Emits one client span per bridge, parented to the pipeline span.
pub struct BridgeEmitter<'a> {
    telemetry: &'a dyn Telemetry,
    options: &'a EmitOptions,
}

impl<'a> BridgeEmitter<'a> {
    pub fn new(telemetry: &'a dyn Telemetry, options: &'a EmitOptions) -> Self {
        Self { telemetry, options }
    }

    pub fn process(
        &self,
        pipeline: PipelineRef<'_>,
        bridges: &[ExecutionRecord],
        parent: SpanContext,
        stats: &mut EntityStats,
    ) {
        for bridge in bridges {
            match self.emit(pipeline, bridge, parent) {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    error!(
                        "Failed to export bridge '{}' of pipeline {}: {e}",
                        bridge.name(),
                        pipeline.pipeline_id
                    );
                    stats.failed += 1;
                }
            }
        }
    }

    fn emit(
        &self,
        pipeline: PipelineRef<'_>,
        bridge: &ExecutionRecord,
        parent: SpanContext,
    ) -> Result<EntityOutcome> {
        let id = require_id(bridge, "bridge")?;
        let timing = EntityTiming::of(bridge)?;
        let flat = self.options.flattener.flatten(bridge.fields());
        let resource = self.options.entity_resource(pipeline, "bridge_id", id, &flat);
        let tracer = self.telemetry.tracer(&resource)?;

        let name = format!("Bridge: {} - bridge_id: {id}", bridge.name());

        if bridge.is_skipped() {
            debug!("Bridge {id} was skipped");
            let span = tracer.start_span(
                &format!("{name} - SKIPPED"),
                Some(parent),
                timing.start,
                SpanKind::Client,
            );
            span.end(timing.end);
            return Ok(EntityOutcome::Skipped);
        }

        let downstream = bridge.downstream();

        let mut span = tracer.start_span(&name, Some(parent), timing.start, SpanKind::Client);
        span.set_attributes(self.options.entity_attributes(&flat));
        if let Some(downstream) = &downstream {
            span.set_attributes(&downstream_attributes(downstream));
        }
        span.set_status(bridge_status(bridge, downstream.as_ref()));
        span.end(timing.end);

        Ok(EntityOutcome::Emitted)
    }
}

fn downstream_attributes(downstream: &DownstreamRef) -> FlatAttributeMap {
    let mut attributes = FlatAttributeMap::new();
    attributes.insert(
        "downstream_project_id".to_string(),
        downstream.project_id.to_string(),
    );
    attributes.insert(
        "downstream_pipeline_id".to_string(),
        downstream.pipeline_id.to_string(),
    );
    if let Some(status) = downstream.status.as_deref().filter(|s| !s.is_empty()) {
        attributes.insert("downstream_status".to_string(), status.to_string());
    }
    if let Some(url) = downstream.web_url.as_deref().filter(|s| !s.is_empty()) {
        attributes.insert("downstream_web_url".to_string(), url.to_string());
    }
    attributes
}

fn bridge_status(bridge: &ExecutionRecord, downstream: Option<&DownstreamRef>) -> SpanStatus {
    if bridge.is_failed() {
        return SpanStatus::Error(
            bridge
                .failure_reason()
                .unwrap_or("Bridge failed")
                .to_string(),
        );
    }

    match downstream {
        Some(downstream) if bridge.status() == "success" => {
            if downstream.is_failed() {
                return SpanStatus::Error("Downstream pipeline failed".to_string());
            }
            match downstream.status.as_deref() {
                Some("success" | "passed") => SpanStatus::Ok,
                _ => SpanStatus::Unset,
            }
        }
        _ => SpanStatus::Unset,
    }
}
