use chrono::{DateTime, Utc};

use crate::attributes::{AttributeFlattener, FlatAttributeMap, ResourceAttributeBuilder};
use crate::error::{ExporterError, Result};
use crate::providers::ExecutionRecord;

/// Settings shared by every emitter during one export pass.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub service_name: String,
    pub low_data_mode: bool,
    pub export_logs: bool,
    /// CI environment attributes, already scrubbed
    pub env_attributes: FlatAttributeMap,
    pub flattener: AttributeFlattener,
}

impl EmitOptions {
    /// Resource for one entity: service identity, owning pipeline, the
    /// entity id under `id_key` and, outside low-data mode, its flattened
    /// fields.
    pub fn entity_resource(
        &self,
        pipeline: PipelineRef<'_>,
        id_key: &str,
        id: u64,
        flat: &FlatAttributeMap,
    ) -> FlatAttributeMap {
        let mut builder = ResourceAttributeBuilder::new(&self.service_name);
        if !self.low_data_mode {
            builder = builder.with_attributes(flat);
        }
        builder
            .with_attribute("pipeline_id", pipeline.pipeline_id.to_string())
            .with_attribute("project_id", pipeline.project_id)
            .with_attribute(id_key, id.to_string())
            .build()
    }

    /// Span attributes for a job or bridge.
    pub fn entity_attributes<'a>(&'a self, flat: &'a FlatAttributeMap) -> &'a FlatAttributeMap {
        if self.low_data_mode {
            &self.env_attributes
        } else {
            flat
        }
    }
}

/// The pipeline an entity belongs to.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRef<'a> {
    pub project_id: &'a str,
    pub pipeline_id: u64,
}

/// Span timestamps for an entity, parsed before any span is opened so a
/// malformed record never leaves a span half-built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityTiming {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl EntityTiming {
    /// Skipped entities start at `started_at` (else `created_at`) and end at
    /// the same instant.
    pub fn of(record: &ExecutionRecord) -> Result<Self> {
        let start = match record.started_at()? {
            Some(start) => Some(start),
            None => record.created_at()?,
        };
        let end = if record.is_skipped() {
            start
        } else {
            record.finished_at()?
        };
        Ok(Self { start, end })
    }
}

pub fn require_id(record: &ExecutionRecord, kind: &'static str) -> Result<u64> {
    record.id().ok_or_else(|| ExporterError::MalformedRecord {
        kind,
        reason: "missing numeric id".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::gitlab::fake::record;
    use serde_json::json;

    fn options(low_data_mode: bool) -> EmitOptions {
        EmitOptions {
            service_name: "group/project".to_string(),
            low_data_mode,
            export_logs: true,
            env_attributes: [("CI_JOB_ID".to_string(), "7".to_string())]
                .into_iter()
                .collect(),
            flattener: AttributeFlattener::default(),
        }
    }

    fn flat() -> FlatAttributeMap {
        [
            ("name".to_string(), "build".to_string()),
            ("stage".to_string(), "compile".to_string()),
        ]
        .into_iter()
        .collect()
    }

    const PIPELINE: PipelineRef<'static> = PipelineRef {
        project_id: "42",
        pipeline_id: 1000,
    };

    #[test]
    fn test_entity_resource_includes_ids_and_fields() {
        let resource = options(false).entity_resource(PIPELINE, "job_id", 7, &flat());

        assert_eq!(resource["service.name"], "group/project");
        assert_eq!(resource["pipeline_id"], "1000");
        assert_eq!(resource["project_id"], "42");
        assert_eq!(resource["job_id"], "7");
        assert_eq!(resource["resource.name"], "build");
        assert_eq!(resource["stage"], "compile");
    }

    #[test]
    fn test_low_data_resource_skips_fields() {
        let resource = options(true).entity_resource(PIPELINE, "job_id", 7, &flat());

        assert_eq!(resource["job_id"], "7");
        assert!(!resource.contains_key("stage"));
        assert!(!resource.contains_key("resource.name"));
    }

    #[test]
    fn test_low_data_attributes_are_environment_only() {
        let opts = options(true);
        let flat = flat();
        assert_eq!(opts.entity_attributes(&flat), &opts.env_attributes);
        assert_eq!(options(false).entity_attributes(&flat), &flat);
    }

    #[test]
    fn test_timing_for_skipped_entity_has_zero_duration() {
        let job = record(json!({
            "status": "skipped",
            "created_at": "2024-01-01T10:00:00Z",
            "finished_at": "2024-01-01T11:00:00Z"
        }));

        let timing = EntityTiming::of(&job).unwrap();
        assert!(timing.start.is_some());
        assert_eq!(timing.start, timing.end);
    }

    #[test]
    fn test_timing_without_finish_has_no_end() {
        let job = record(json!({
            "status": "running",
            "started_at": "2024-01-01T10:00:00Z"
        }));

        let timing = EntityTiming::of(&job).unwrap();
        assert!(timing.start.is_some());
        assert_eq!(timing.end, None);
    }

    #[test]
    fn test_require_id() {
        assert_eq!(require_id(&record(json!({ "id": 3 })), "job").unwrap(), 3);
        assert!(matches!(
            require_id(&record(json!({})), "job"),
            Err(ExporterError::MalformedRecord { kind: "job", .. })
        ));
    }
}
