use chrono::{DateTime, NaiveDate, Utc};

use super::types::{DoraMetric, ExecutionRecord};
use crate::error::Result;

/// Read-only view of the GitLab CI API the exporter depends on.
///
/// `project_id` is either a numeric id or a URL path (`group/project`).
/// List calls return fully materialized results; pagination is hidden.
#[allow(async_fn_in_trait)]
pub trait CiApi {
    async fn get_project(&self, project_id: &str) -> Result<ExecutionRecord>;

    async fn get_pipeline(&self, project_id: &str, pipeline_id: u64) -> Result<ExecutionRecord>;

    async fn list_jobs(&self, project_id: &str, pipeline_id: u64) -> Result<Vec<ExecutionRecord>>;

    async fn list_bridges(&self, project_id: &str, pipeline_id: u64)
        -> Result<Vec<ExecutionRecord>>;

    /// Pipelines of `project_id` updated after `updated_after`.
    async fn list_pipelines(
        &self,
        project_id: &str,
        updated_after: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Raw job trace bytes.
    async fn download_log(&self, project_id: &str, job_id: u64) -> Result<Vec<u8>>;

    /// Projects directly under the group at `group_path`.
    async fn list_group_projects(&self, group_path: &str) -> Result<Vec<ExecutionRecord>>;

    async fn list_environments(&self, project_id: &str) -> Result<Vec<ExecutionRecord>>;

    /// Deployments of `project_id` updated after `updated_after`.
    async fn list_deployments(
        &self,
        project_id: &str,
        updated_after: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Releases of `project_id`, newest first.
    async fn list_releases(&self, project_id: &str) -> Result<Vec<ExecutionRecord>>;

    /// Runners available to `project_id`, shared runners included.
    async fn list_runners(&self, project_id: &str) -> Result<Vec<ExecutionRecord>>;

    /// Daily `{date, value}` points of one DORA metric since `start_date`.
    async fn dora_metric(
        &self,
        project_id: &str,
        metric: DoraMetric,
        start_date: NaiveDate,
    ) -> Result<Vec<ExecutionRecord>>;
}
