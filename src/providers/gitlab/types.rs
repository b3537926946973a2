use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ExporterError, Result};

/// A project, pipeline, job, bridge or other GitLab resource exactly as
/// returned by the API.
///
/// Kept as the raw JSON object so every field can be flattened into span
/// attributes. Accessors expose the handful of fields the exporter acts on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionRecord(Map<String, Value>);

impl ExecutionRecord {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Numeric id; accepts both JSON numbers and numeric strings.
    pub fn id(&self) -> Option<u64> {
        as_id(self.0.get("id")?)
    }

    pub fn name(&self) -> &str {
        self.str_field("name").unwrap_or_default()
    }

    pub fn stage(&self) -> &str {
        self.str_field("stage").unwrap_or_default()
    }

    pub fn status(&self) -> &str {
        self.str_field("status").unwrap_or_default()
    }

    pub fn is_failed(&self) -> bool {
        self.status() == "failed"
    }

    pub fn is_skipped(&self) -> bool {
        self.status() == "skipped"
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.str_field("failure_reason").filter(|r| !r.is_empty())
    }

    pub fn started_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("started_at")
    }

    pub fn finished_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("finished_at")
    }

    pub fn created_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("created_at")
    }

    /// Parses an RFC 3339 timestamp field. Absent or null fields are `None`.
    pub fn timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>> {
        match self.str_field(field).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(value) => DateTime::parse_from_rfc3339(value)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|_| ExporterError::InvalidTimestamp {
                    field: field.to_string(),
                    value: value.to_string(),
                }),
        }
    }

    /// The pipeline a bridge triggered, if GitLab created one.
    pub fn downstream(&self) -> Option<DownstreamRef> {
        let downstream = self.0.get("downstream_pipeline")?.as_object()?;
        let text = |key: &str| {
            downstream
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Some(DownstreamRef {
            project_id: as_id(downstream.get("project_id")?)?,
            pipeline_id: as_id(downstream.get("id")?)?,
            status: text("status"),
            web_url: text("web_url"),
        })
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// DORA key metrics GitLab reports per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoraMetric {
    DeploymentFrequency,
    LeadTimeForChanges,
    TimeToRestoreService,
    ChangeFailureRate,
}

impl DoraMetric {
    pub const ALL: [Self; 4] = [
        Self::DeploymentFrequency,
        Self::LeadTimeForChanges,
        Self::TimeToRestoreService,
        Self::ChangeFailureRate,
    ];

    /// Name used both as the API `metric` parameter and in the counter name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeploymentFrequency => "deployment_frequency",
            Self::LeadTimeForChanges => "lead_time_for_changes",
            Self::TimeToRestoreService => "time_to_restore_service",
            Self::ChangeFailureRate => "change_failure_rate",
        }
    }
}

/// Reference from a bridge to the pipeline it triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamRef {
    pub project_id: u64,
    pub pipeline_id: u64,
    pub status: Option<String>,
    pub web_url: Option<String>,
}

impl DownstreamRef {
    pub fn is_failed(&self) -> bool {
        self.status.as_deref() == Some("failed")
    }

    pub fn key(&self) -> (u64, u64) {
        (self.project_id, self.pipeline_id)
    }
}
