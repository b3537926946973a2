use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;

use super::filter::ExclusionSet;
use super::span::require_id;
use super::summary::{EntityOutcome, EntityStats, MetricsSummary, ProjectSummary};
use crate::attributes::{
    service_name, AttributeFlattener, FlatAttributeMap, MetricsAttributeSelector,
    ResourceAttributeBuilder,
};
use crate::config::ExporterConfig;
use crate::error::{ExporterError, Result};
use crate::providers::{CiApi, DoraMetric, ExecutionRecord};
use crate::telemetry::{Severity, Telemetry};

const SOURCE: &str = "gitlab-metrics-exporter";

/// Which resource type, counters and log body an entity is exported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricEntity {
    Project,
    Pipeline,
    Job,
    Environment,
    Deployment,
    Release,
    Runner,
}

impl MetricEntity {
    const EVENTS: [Self; 4] = [
        Self::Environment,
        Self::Deployment,
        Self::Release,
        Self::Runner,
    ];

    fn resource_type(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Pipeline => "pipeline",
            Self::Job => "job",
            Self::Environment => "environment",
            Self::Deployment => "deployment",
            Self::Release => "release",
            Self::Runner => "runner",
        }
    }

    /// Only pipelines and jobs carry duration counters.
    fn counter_prefix(self) -> Option<&'static str> {
        match self {
            Self::Pipeline => Some("gitlab_pipelines"),
            Self::Job => Some("gitlab_jobs"),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Project => "Project",
            Self::Pipeline => "Pipeline",
            Self::Job => "Job",
            Self::Environment => "Environment",
            Self::Deployment => "Deployment",
            Self::Release => "Release",
            Self::Runner => "Runner",
        }
    }

    fn log_body(self, id: u64, project: &ProjectScope) -> String {
        let service = &project.service_name;
        match self {
            Self::Project => format!("Project: {id} - {service} data"),
            Self::Pipeline | Self::Job => format!(
                "{}: {id} - from project: {} - {service} data",
                self.label(),
                project.key
            ),
            _ => format!("{}: {id} from project: {} - {service} data", self.label(), project.key),
        }
    }
}

/// A project selected for export.
struct ProjectScope {
    /// Id or path used for API calls
    key: String,
    record: ExecutionRecord,
    service_name: String,
}

struct PipelineOutcome {
    pipeline_id: u64,
    result: Result<()>,
    jobs: EntityStats,
}

/// Exports duration metrics and descriptive log records for recently
/// updated pipelines and jobs, log records for a project's environments,
/// deployments, releases and runners, and optionally DORA counters.
pub struct MetricsExporter<'a, A> {
    api: &'a A,
    telemetry: &'a dyn Telemetry,
    config: &'a ExporterConfig,
    flattener: AttributeFlattener,
    selector: MetricsAttributeSelector,
    exclusions: ExclusionSet,
}

impl<'a, A: CiApi> MetricsExporter<'a, A> {
    pub fn new(api: &'a A, telemetry: &'a dyn Telemetry, config: &'a ExporterConfig) -> Self {
        Self {
            api,
            telemetry,
            config,
            flattener: config.flattener(),
            selector: MetricsAttributeSelector::new(&config.dimension_metrics),
            exclusions: ExclusionSet::new(&config.exclude_jobs),
        }
    }

    /// Exports every selected project for the last `export_last_minutes + 1`
    /// minutes before `now`.
    ///
    /// Without `export_paths` the configured project is exported and any
    /// failure is fatal. With `export_paths` a failing project is logged and
    /// counted and the remaining projects still run.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<MetricsSummary> {
        let window_minutes = self.config.export_last_minutes.saturating_add(1);
        let updated_after = i64::try_from(window_minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .ok_or_else(|| {
                ExporterError::Config(format!("export window of {window_minutes} minutes is too large"))
            })?;

        let mut summary = MetricsSummary {
            window_minutes,
            ..MetricsSummary::default()
        };

        let projects = self.select_projects().await?;
        if projects.is_empty() {
            warn!(
                "No project under {} matched the configured project regex, nothing to export",
                self.config.export_paths.join(", ")
            );
        }

        for project in &projects {
            match self.export_project(project, now, updated_after, &mut summary).await {
                Ok(()) => summary.projects.push(ProjectSummary {
                    project_id: project.key.clone(),
                    service_name: project.service_name.clone(),
                }),
                Err(e) if !self.config.export_paths.is_empty() => {
                    error!("Failed to export metrics for project {}: {e}", project.key);
                    summary.projects_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Exported metrics for {} projects ({} failed), {} pipelines ({} failed) and {} jobs",
            summary.projects.len(),
            summary.projects_failed,
            summary.pipelines.emitted,
            summary.pipelines.failed,
            summary.jobs.emitted
        );
        Ok(summary)
    }

    /// The configured project, or every project directly under one of the
    /// `export_paths` groups whose name matches `export_projects_regex`.
    async fn select_projects(&self) -> Result<Vec<ProjectScope>> {
        if self.config.export_paths.is_empty() {
            let key = self.config.project_id.clone();
            let record = self.api.get_project(&key).await?;
            return Ok(vec![self.scope(key, record)]);
        }

        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for path in &self.config.export_paths {
            let projects = match self.api.list_group_projects(path).await {
                Ok(projects) => projects,
                Err(e) => {
                    error!("Could not list projects under {path}: {e}");
                    continue;
                }
            };

            for project in projects {
                let matches = self
                    .config
                    .export_projects_regex
                    .as_ref()
                    .is_none_or(|regex| regex.is_match(project.name()));
                if !matches {
                    debug!("Project '{}' in {path} does not match the project regex", project.name());
                    continue;
                }
                let Some(id) = project.id() else {
                    warn!("Skipping project '{}' in {path} without an id", project.name());
                    continue;
                };
                if seen.insert(id) {
                    info!("Project '{}' in {path} matched, collecting data", project.name());
                    selected.push(self.scope(id.to_string(), project));
                }
            }
        }
        Ok(selected)
    }

    fn scope(&self, key: String, record: ExecutionRecord) -> ProjectScope {
        let service_name = service_name(
            record.fields(),
            self.config.take_namespace_slug,
            &self.config.service_name,
        );
        ProjectScope {
            key,
            record,
            service_name,
        }
    }

    async fn export_project(
        &self,
        project: &ProjectScope,
        now: DateTime<Utc>,
        updated_after: DateTime<Utc>,
        summary: &mut MetricsSummary,
    ) -> Result<()> {
        for entity in MetricEntity::EVENTS {
            let stats = self.export_events(project, entity, updated_after).await;
            let target = match entity {
                MetricEntity::Environment => &mut summary.events.environments,
                MetricEntity::Deployment => &mut summary.events.deployments,
                MetricEntity::Release => &mut summary.events.releases,
                _ => &mut summary.events.runners,
            };
            target.merge(&stats);
        }

        self.export_pipelines(project, updated_after, summary).await?;

        if self.config.dora_metrics {
            self.export_dora(project, now, &mut summary.dora).await;
        }

        let id = require_id(&project.record, "project")?;
        self.emit(&project.record, id, MetricEntity::Project, project)
    }

    async fn export_pipelines(
        &self,
        project: &ProjectScope,
        updated_after: DateTime<Utc>,
        summary: &mut MetricsSummary,
    ) -> Result<()> {
        let pipelines = self.api.list_pipelines(&project.key, updated_after).await?;
        info!(
            "Exporting metrics for {} pipelines of project {} updated after {updated_after}",
            pipelines.len(),
            project.key
        );

        let mut ids = Vec::with_capacity(pipelines.len());
        for pipeline in &pipelines {
            match pipeline.id() {
                Some(id) => ids.push(id),
                None => {
                    warn!("Skipping listed pipeline without an id");
                    summary.pipelines.failed += 1;
                }
            }
        }

        let mut outcomes = stream::iter(ids)
            .map(|pipeline_id| self.export_pipeline(project, pipeline_id))
            .buffer_unordered(self.config.max_concurrency);

        while let Some(outcome) = outcomes.next().await {
            match outcome.result {
                Ok(()) => summary.pipelines.record(EntityOutcome::Emitted),
                Err(e) => {
                    error!(
                        "Failed to export metrics for pipeline {} of project {}: {e}",
                        outcome.pipeline_id, project.key
                    );
                    summary.pipelines.failed += 1;
                }
            }
            summary.jobs.merge(&outcome.jobs);
        }

        Ok(())
    }

    async fn export_pipeline(&self, project: &ProjectScope, pipeline_id: u64) -> PipelineOutcome {
        let mut jobs = EntityStats::default();
        let result = self.try_export_pipeline(project, pipeline_id, &mut jobs).await;
        PipelineOutcome {
            pipeline_id,
            result,
            jobs,
        }
    }

    async fn try_export_pipeline(
        &self,
        project: &ProjectScope,
        pipeline_id: u64,
        stats: &mut EntityStats,
    ) -> Result<()> {
        let pipeline = self.api.get_pipeline(&project.key, pipeline_id).await?;
        let jobs = self.api.list_jobs(&project.key, pipeline_id).await?;

        self.emit(&pipeline, pipeline_id, MetricEntity::Pipeline, project)?;

        let (jobs, excluded) = self.exclusions.filter(jobs);
        stats.excluded += excluded;

        for job in &jobs {
            let emitted = require_id(job, "job")
                .and_then(|id| self.emit(job, id, MetricEntity::Job, project));
            match emitted {
                Ok(()) => stats.record(EntityOutcome::Emitted),
                Err(e) => {
                    error!(
                        "Failed to export metrics for job '{}' of pipeline {pipeline_id}: {e}",
                        job.name()
                    );
                    stats.failed += 1;
                }
            }
        }

        Ok(())
    }

    /// One log record per environment, deployment, release or runner in
    /// scope. A failed listing is logged and counted; it never fails the
    /// project.
    async fn export_events(
        &self,
        project: &ProjectScope,
        entity: MetricEntity,
        updated_after: DateTime<Utc>,
    ) -> EntityStats {
        let mut stats = EntityStats::default();
        let key = project.key.as_str();
        let listed = match entity {
            MetricEntity::Environment => self.api.list_environments(key).await,
            MetricEntity::Deployment => self.api.list_deployments(key, updated_after).await,
            MetricEntity::Release => self.api.list_releases(key).await,
            MetricEntity::Runner => self.api.list_runners(key).await,
            MetricEntity::Project | MetricEntity::Pipeline | MetricEntity::Job => Ok(Vec::new()),
        };
        let records = match listed {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    "Could not list {}s of project {key}: {e}",
                    entity.resource_type()
                );
                stats.failed += 1;
                return stats;
            }
        };

        for record in &records {
            let emitted = in_scope(entity, record, updated_after).and_then(|keep| {
                if !keep {
                    return Ok(false);
                }
                let id = require_id(record, entity.resource_type())?;
                self.emit(record, id, entity, project).map(|()| true)
            });
            match emitted {
                Ok(true) => stats.record(EntityOutcome::Emitted),
                Ok(false) => stats.excluded += 1,
                Err(e) => {
                    error!(
                        "Failed to export {} of project {key}: {e}",
                        entity.resource_type()
                    );
                    stats.failed += 1;
                }
            }
        }

        debug!(
            "Sent {} {} events for project {key}",
            stats.emitted,
            entity.resource_type()
        );
        stats
    }

    /// `gitlab_dora_<metric>` counters for yesterday onwards, one data point
    /// per day tagged with its `date`. Change failure rate is sent as a
    /// percentage and days without a value count as zero.
    async fn export_dora(&self, project: &ProjectScope, now: DateTime<Utc>, stats: &mut EntityStats) {
        let today = now.date_naive();
        let start_date = today.pred_opt().unwrap_or(today);
        let meter = match self.telemetry.meter(&dora_resource(project)) {
            Ok(meter) => meter,
            Err(e) => {
                error!("Skipping DORA metrics of project {}: {e}", project.key);
                stats.failed += 1;
                return;
            }
        };

        for metric in DoraMetric::ALL {
            let points = match self.api.dora_metric(&project.key, metric, start_date).await {
                Ok(points) => points,
                Err(e) => {
                    warn!(
                        "Unable to obtain DORA metric {} of project {}: {e}",
                        metric.as_str(),
                        project.key
                    );
                    stats.failed += 1;
                    continue;
                }
            };

            let name = format!("gitlab_dora_{}", metric.as_str());
            for point in &points {
                let value = point.fields().get("value").and_then(Value::as_f64).unwrap_or(0.0);
                let value = if metric == DoraMetric::ChangeFailureRate {
                    value * 100.0
                } else {
                    value
                };
                let mut attributes = FlatAttributeMap::new();
                if let Some(date) = point.fields().get("date").and_then(Value::as_str) {
                    attributes.insert("date".to_string(), date.to_string());
                }
                meter.add_counter(&name, value, &attributes);
                stats.record(EntityOutcome::Emitted);
            }
        }
    }

    fn emit(
        &self,
        record: &ExecutionRecord,
        id: u64,
        entity: MetricEntity,
        project: &ProjectScope,
    ) -> Result<()> {
        let flat = self.flattener.flatten(record.fields());
        let mut resource = ResourceAttributeBuilder::from_flat(&flat, &project.service_name);

        if let Some(prefix) = entity.counter_prefix() {
            let selection = self.selector.select(&resource);
            let mut dimensions = selection.dimensions;
            tag_source(&mut dimensions, entity.resource_type());
            let meter = self.telemetry.meter(&dimensions)?;
            meter.add_counter(&format!("{prefix}.duration"), selection.duration, &dimensions);
            meter.add_counter(
                &format!("{prefix}.queued_duration"),
                selection.queued_duration,
                &dimensions,
            );
        }

        tag_source(&mut resource, entity.resource_type());
        let logger = self.telemetry.logger(&resource)?;
        logger.emit(Severity::Info, &entity.log_body(id, project));

        Ok(())
    }
}

/// Environments count when updated and releases when created inside the
/// window; only project-specific runners are reported. Deployments are
/// already filtered by the API.
fn in_scope(entity: MetricEntity, record: &ExecutionRecord, updated_after: DateTime<Utc>) -> Result<bool> {
    Ok(match entity {
        MetricEntity::Environment => record
            .timestamp("updated_at")?
            .is_some_and(|at| at >= updated_after),
        MetricEntity::Release => record.created_at()?.is_some_and(|at| at >= updated_after),
        MetricEntity::Runner => record.fields().get("is_shared").and_then(Value::as_bool) == Some(false),
        _ => true,
    })
}

fn dora_resource(project: &ProjectScope) -> FlatAttributeMap {
    let fields = project.record.fields();
    let namespace = |key: &str| {
        fields
            .get("namespace")
            .and_then(|n| n.get(key))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let mut resource = ResourceAttributeBuilder::new(&project.service_name)
        .with_attribute(
            "project.id",
            project.record.id().map_or_else(|| project.key.clone(), |id| id.to_string()),
        )
        .with_attribute("namespace.path", namespace("path"))
        .with_attribute("namespace.kind", namespace("kind"))
        .with_attribute(
            "url",
            fields.get("web_url").and_then(Value::as_str).unwrap_or_default(),
        )
        .build();
    tag_source(&mut resource, "dora-metrics");
    resource
}

fn tag_source(attributes: &mut FlatAttributeMap, resource_type: &str) {
    attributes.insert("gitlab.source".to_string(), SOURCE.to_string());
    attributes.insert("gitlab.resource.type".to_string(), resource_type.to_string());
}
