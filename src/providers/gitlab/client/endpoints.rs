use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use log::debug;

use super::core::GitLabClient;
use crate::error::{ExporterError, Result};
use crate::providers::gitlab::api::CiApi;
use crate::providers::gitlab::types::{DoraMetric, ExecutionRecord};

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn not_found(err: ExporterError, mapped: impl FnOnce() -> ExporterError) -> ExporterError {
    match err {
        ExporterError::Api { status: 404, .. } => mapped(),
        other => other,
    }
}

impl CiApi for GitLabClient {
    async fn get_project(&self, project_id: &str) -> Result<ExecutionRecord> {
        let url = self.project_url(project_id, &[])?;
        self.get_json(url)
            .await
            .map_err(|e| not_found(e, || ExporterError::ProjectNotFound(project_id.to_string())))
    }

    async fn get_pipeline(&self, project_id: &str, pipeline_id: u64) -> Result<ExecutionRecord> {
        let pipeline = pipeline_id.to_string();
        let url = self.project_url(project_id, &["pipelines", pipeline.as_str()])?;
        self.get_json(url).await.map_err(|e| {
            not_found(e, || {
                ExporterError::PipelineNotFound(format!("{project_id}/{pipeline_id}"))
            })
        })
    }

    async fn list_jobs(&self, project_id: &str, pipeline_id: u64) -> Result<Vec<ExecutionRecord>> {
        let pipeline = pipeline_id.to_string();
        let url = self.project_url(project_id, &["pipelines", pipeline.as_str(), "jobs"])?;
        let jobs = self.get_all_pages(url, &[]).await?;
        debug!("Pipeline {pipeline_id} has {} jobs", jobs.len());
        Ok(jobs)
    }

    async fn list_bridges(
        &self,
        project_id: &str,
        pipeline_id: u64,
    ) -> Result<Vec<ExecutionRecord>> {
        let pipeline = pipeline_id.to_string();
        let url = self.project_url(project_id, &["pipelines", pipeline.as_str(), "bridges"])?;
        let bridges = self.get_all_pages(url, &[]).await?;
        debug!("Pipeline {pipeline_id} has {} bridges", bridges.len());
        Ok(bridges)
    }

    async fn list_pipelines(
        &self,
        project_id: &str,
        updated_after: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        let url = self.project_url(project_id, &["pipelines"])?;
        let query = [("updated_after", timestamp(updated_after))];
        self.get_all_pages(url, &query)
            .await
            .map_err(|e| not_found(e, || ExporterError::ProjectNotFound(project_id.to_string())))
    }

    async fn download_log(&self, project_id: &str, job_id: u64) -> Result<Vec<u8>> {
        let job = job_id.to_string();
        let url = self.project_url(project_id, &["jobs", job.as_str(), "trace"])?;
        let response = self.get_with_retry(url).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn list_group_projects(&self, group_path: &str) -> Result<Vec<ExecutionRecord>> {
        let url = self.group_url(group_path, &["projects"])?;
        let projects = self
            .get_all_pages(url, &[])
            .await
            .map_err(|e| not_found(e, || ExporterError::GroupNotFound(group_path.to_string())))?;
        debug!("Group {group_path} has {} projects", projects.len());
        Ok(projects)
    }

    async fn list_environments(&self, project_id: &str) -> Result<Vec<ExecutionRecord>> {
        let url = self.project_url(project_id, &["environments"])?;
        self.get_all_pages(url, &[]).await
    }

    async fn list_deployments(
        &self,
        project_id: &str,
        updated_after: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        let url = self.project_url(project_id, &["deployments"])?;
        let query = [
            ("updated_after", timestamp(updated_after)),
            ("order_by", "updated_at".to_string()),
        ];
        self.get_all_pages(url, &query).await
    }

    async fn list_releases(&self, project_id: &str) -> Result<Vec<ExecutionRecord>> {
        let url = self.project_url(project_id, &["releases"])?;
        self.get_all_pages(url, &[("sort", "desc".to_string())]).await
    }

    async fn list_runners(&self, project_id: &str) -> Result<Vec<ExecutionRecord>> {
        let url = self.project_url(project_id, &["runners"])?;
        self.get_all_pages(url, &[]).await
    }

    async fn dora_metric(
        &self,
        project_id: &str,
        metric: DoraMetric,
        start_date: NaiveDate,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut url = self.project_url(project_id, &["dora", "metrics"])?;
        url.query_pairs_mut()
            .append_pair("metric", metric.as_str())
            .append_pair("start_date", &start_date.to_string());
        self.get_json(url).await
    }
}
