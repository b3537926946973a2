//! In-memory `CiApi` used by exporter tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use super::api::CiApi;
use super::types::{DoraMetric, ExecutionRecord};
use crate::error::{ExporterError, Result};

type PipelineKey = (String, u64);

#[derive(Default)]
pub struct FakeCiApi {
    projects: HashMap<String, ExecutionRecord>,
    pipelines: HashMap<PipelineKey, ExecutionRecord>,
    jobs: HashMap<PipelineKey, Vec<ExecutionRecord>>,
    bridges: HashMap<PipelineKey, Vec<ExecutionRecord>>,
    logs: HashMap<(String, u64), Vec<u8>>,
    group_projects: HashMap<String, Vec<ExecutionRecord>>,
    resources: HashMap<(String, &'static str), Vec<ExecutionRecord>>,
    dora: HashMap<(String, &'static str), Vec<ExecutionRecord>>,
    unreachable: HashSet<String>,
    failing_jobs: HashSet<PipelineKey>,
    calls: Mutex<Vec<String>>,
}

pub fn record(value: Value) -> ExecutionRecord {
    serde_json::from_value(value).unwrap()
}

impl FakeCiApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project_id: &str, project: Value) -> Self {
        self.projects.insert(project_id.to_string(), record(project));
        self
    }

    pub fn with_pipeline(mut self, project_id: &str, pipeline: Value) -> Self {
        let pipeline = record(pipeline);
        let id = pipeline.id().unwrap();
        self.pipelines.insert((project_id.to_string(), id), pipeline);
        self
    }

    pub fn with_jobs(mut self, project_id: &str, pipeline_id: u64, jobs: Vec<Value>) -> Self {
        self.jobs.insert(
            (project_id.to_string(), pipeline_id),
            jobs.into_iter().map(record).collect(),
        );
        self
    }

    pub fn with_bridges(mut self, project_id: &str, pipeline_id: u64, bridges: Vec<Value>) -> Self {
        self.bridges.insert(
            (project_id.to_string(), pipeline_id),
            bridges.into_iter().map(record).collect(),
        );
        self
    }

    pub fn with_log(mut self, project_id: &str, job_id: u64, log: &str) -> Self {
        self.logs
            .insert((project_id.to_string(), job_id), log.as_bytes().to_vec());
        self
    }

    pub fn with_group_projects(mut self, group_path: &str, projects: Vec<Value>) -> Self {
        self.group_projects.insert(
            group_path.to_string(),
            projects.into_iter().map(record).collect(),
        );
        self
    }

    /// `kind` is one of `environments`, `deployments`, `releases` or `runners`.
    pub fn with_resources(mut self, project_id: &str, kind: &'static str, items: Vec<Value>) -> Self {
        self.resources.insert(
            (project_id.to_string(), kind),
            items.into_iter().map(record).collect(),
        );
        self
    }

    pub fn with_dora(mut self, project_id: &str, metric: DoraMetric, points: Vec<Value>) -> Self {
        self.dora.insert(
            (project_id.to_string(), metric.as_str()),
            points.into_iter().map(record).collect(),
        );
        self
    }

    /// Every call against `project_id` fails with a 403.
    pub fn with_unreachable_project(mut self, project_id: &str) -> Self {
        self.unreachable.insert(project_id.to_string());
        self
    }

    /// Listing the jobs of this pipeline fails with a 500.
    pub fn with_failing_jobs(mut self, project_id: &str, pipeline_id: u64) -> Self {
        self.failing_jobs
            .insert((project_id.to_string(), pipeline_id));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record_call(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn resources(&self, project_id: &str, kind: &'static str) -> Result<Vec<ExecutionRecord>> {
        self.record_call(format!("{kind} {project_id}"));
        self.check_access(project_id)?;
        Ok(self
            .resources
            .get(&(project_id.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }

    fn check_access(&self, project_id: &str) -> Result<()> {
        if self.unreachable.contains(project_id) {
            return Err(ExporterError::Api {
                status: 403,
                message: "403 Forbidden".to_string(),
            });
        }
        Ok(())
    }
}

impl CiApi for FakeCiApi {
    async fn get_project(&self, project_id: &str) -> Result<ExecutionRecord> {
        self.record_call(format!("project {project_id}"));
        self.check_access(project_id)?;
        self.projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| ExporterError::ProjectNotFound(project_id.to_string()))
    }

    async fn get_pipeline(&self, project_id: &str, pipeline_id: u64) -> Result<ExecutionRecord> {
        self.record_call(format!("pipeline {project_id}/{pipeline_id}"));
        self.check_access(project_id)?;
        self.pipelines
            .get(&(project_id.to_string(), pipeline_id))
            .cloned()
            .ok_or_else(|| ExporterError::PipelineNotFound(format!("{project_id}/{pipeline_id}")))
    }

    async fn list_jobs(&self, project_id: &str, pipeline_id: u64) -> Result<Vec<ExecutionRecord>> {
        self.record_call(format!("jobs {project_id}/{pipeline_id}"));
        self.check_access(project_id)?;
        if self.failing_jobs.contains(&(project_id.to_string(), pipeline_id)) {
            return Err(ExporterError::ApiErrorAfterRetries {
                status: 500,
                retries: 0,
            });
        }
        Ok(self
            .jobs
            .get(&(project_id.to_string(), pipeline_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_bridges(
        &self,
        project_id: &str,
        pipeline_id: u64,
    ) -> Result<Vec<ExecutionRecord>> {
        self.record_call(format!("bridges {project_id}/{pipeline_id}"));
        self.check_access(project_id)?;
        Ok(self
            .bridges
            .get(&(project_id.to_string(), pipeline_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_pipelines(
        &self,
        project_id: &str,
        _updated_after: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        self.record_call(format!("pipelines {project_id}"));
        self.check_access(project_id)?;
        let mut pipelines: Vec<_> = self
            .pipelines
            .iter()
            .filter(|((project, _), _)| project == project_id)
            .map(|(_, pipeline)| pipeline.clone())
            .collect();
        pipelines.sort_by_key(ExecutionRecord::id);
        Ok(pipelines)
    }

    async fn download_log(&self, project_id: &str, job_id: u64) -> Result<Vec<u8>> {
        self.record_call(format!("log {project_id}/{job_id}"));
        self.check_access(project_id)?;
        self.logs
            .get(&(project_id.to_string(), job_id))
            .cloned()
            .ok_or_else(|| ExporterError::Api {
                status: 404,
                message: "404 Not Found".to_string(),
            })
    }

    async fn list_group_projects(&self, group_path: &str) -> Result<Vec<ExecutionRecord>> {
        self.record_call(format!("group {group_path}"));
        self.group_projects
            .get(group_path)
            .cloned()
            .ok_or_else(|| ExporterError::GroupNotFound(group_path.to_string()))
    }

    async fn list_environments(&self, project_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.resources(project_id, "environments")
    }

    async fn list_deployments(
        &self,
        project_id: &str,
        updated_after: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        let deployments = self.resources(project_id, "deployments")?;
        Ok(deployments
            .into_iter()
            .filter(|d| {
                d.timestamp("updated_at")
                    .ok()
                    .flatten()
                    .is_none_or(|at| at > updated_after)
            })
            .collect())
    }

    async fn list_releases(&self, project_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.resources(project_id, "releases")
    }

    async fn list_runners(&self, project_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.resources(project_id, "runners")
    }

    async fn dora_metric(
        &self,
        project_id: &str,
        metric: DoraMetric,
        _start_date: NaiveDate,
    ) -> Result<Vec<ExecutionRecord>> {
        self.record_call(format!("dora {project_id} {}", metric.as_str()));
        self.check_access(project_id)?;
        Ok(self
            .dora
            .get(&(project_id.to_string(), metric.as_str()))
            .cloned()
            .unwrap_or_default())
    }
}
