use chrono::{DateTime, Utc};
use log::{debug, info};

use super::filter::ExclusionSet;
use super::span::{require_id, EmitOptions, EntityTiming};
use super::summary::TraceSummary;
use crate::attributes::{FlatAttributeMap, ResourceAttributeBuilder};
use crate::error::Result;
use crate::providers::{CiApi, ExecutionRecord};
use crate::telemetry::{SpanContext, SpanHandle, SpanKind, SpanStatus, SpanTracer, Telemetry};

const PIPELINE_FAILED_MESSAGE: &str = "Pipeline failed, check jobs for more details";

/// The open pipeline span.
///
/// Closed with the pipeline's `finished_at` by `finish`, or on drop if the
/// caller bails out early, so the root span is never left open.
pub struct PipelineSpan {
    span: Option<Box<dyn SpanHandle>>,
    end: Option<DateTime<Utc>>,
    // Keeps the tracer (and its export pipeline) alive until the span ends.
    _tracer: Box<dyn SpanTracer>,
}

impl PipelineSpan {
    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(span) = self.span.take() {
            span.end(self.end);
        }
    }
}

impl Drop for PipelineSpan {
    fn drop(&mut self) {
        self.close();
    }
}

/// An opened pipeline together with the jobs and bridges to emit under it.
pub struct PipelineTrace {
    pub span: PipelineSpan,
    pub context: SpanContext,
    pub jobs: Vec<ExecutionRecord>,
    pub bridges: Vec<ExecutionRecord>,
}

/// Opens the root span of a pipeline trace.
pub struct TraceHierarchyBuilder<'a, A> {
    api: &'a A,
    telemetry: &'a dyn Telemetry,
    options: &'a EmitOptions,
    exclusions: &'a ExclusionSet,
}

impl<'a, A: CiApi> TraceHierarchyBuilder<'a, A> {
    pub fn new(
        api: &'a A,
        telemetry: &'a dyn Telemetry,
        options: &'a EmitOptions,
        exclusions: &'a ExclusionSet,
    ) -> Self {
        Self {
            api,
            telemetry,
            options,
            exclusions,
        }
    }

    /// Lists and filters the pipeline's jobs and bridges, then opens the
    /// pipeline span.
    ///
    /// Returns `Ok(None)` when nothing is left to export after filtering; no
    /// span is opened in that case.
    pub async fn process(
        &self,
        project_id: &str,
        pipeline: &ExecutionRecord,
        summary: &mut TraceSummary,
    ) -> Result<Option<PipelineTrace>> {
        let pipeline_id = require_id(pipeline, "pipeline")?;

        let jobs = self.api.list_jobs(project_id, pipeline_id).await?;
        let bridges = self.api.list_bridges(project_id, pipeline_id).await?;

        let (jobs, excluded_jobs) = self.exclusions.filter(jobs);
        let (bridges, excluded_bridges) = self.exclusions.filter(bridges);
        summary.jobs.excluded += excluded_jobs;
        summary.bridges.excluded += excluded_bridges;

        if jobs.is_empty() && bridges.is_empty() {
            info!("Pipeline {pipeline_id} has no jobs or bridges left to export");
            return Ok(None);
        }

        let timing = EntityTiming::of(pipeline)?;
        let resource = self.pipeline_resource(project_id, pipeline_id, pipeline);
        let tracer = self.telemetry.tracer(&resource)?;

        let mut span = tracer.start_span(
            &format!("{} - pipeline: {pipeline_id}", self.options.service_name),
            None,
            timing.start,
            SpanKind::Server,
        );
        span.set_attributes(&self.pipeline_attributes(pipeline));
        if pipeline.is_failed() {
            span.set_status(SpanStatus::Error(PIPELINE_FAILED_MESSAGE.to_string()));
        }

        let context = span.context();
        debug!(
            "Opened pipeline {pipeline_id} span with {} jobs and {} bridges",
            jobs.len(),
            bridges.len()
        );

        Ok(Some(PipelineTrace {
            span: PipelineSpan {
                span: Some(span),
                end: timing.end,
                _tracer: tracer,
            },
            context,
            jobs,
            bridges,
        }))
    }

    fn pipeline_resource(
        &self,
        project_id: &str,
        pipeline_id: u64,
        pipeline: &ExecutionRecord,
    ) -> FlatAttributeMap {
        let mut builder = ResourceAttributeBuilder::new(&self.options.service_name);
        if !self.options.low_data_mode {
            builder = builder.with_attributes(&self.options.flattener.flatten(pipeline.fields()));
        }
        builder
            .with_attribute("pipeline_id", pipeline_id.to_string())
            .with_attribute("project_id", project_id)
            .build()
    }

    /// Flattened pipeline overlaid with the environment attributes, or the
    /// environment attributes alone in low-data mode.
    fn pipeline_attributes(&self, pipeline: &ExecutionRecord) -> FlatAttributeMap {
        if self.options.low_data_mode {
            return self.options.env_attributes.clone();
        }

        let mut attributes = self.options.flattener.flatten(pipeline.fields());
        attributes.extend(self.options.env_attributes.clone());
        attributes
    }
}
