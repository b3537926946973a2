//! Turns one CI pipeline, and the downstream pipelines its bridges trigger,
//! into spans, log records and metrics.

mod bridge;
mod downstream;
mod filter;
mod job;
mod metrics;
mod pipeline;
mod span;
mod summary;

use log::info;

use crate::attributes::{service_name, FlatAttributeMap};
use crate::config::ExporterConfig;
use crate::error::{ExporterError, Result};
use crate::providers::CiApi;
use crate::telemetry::Telemetry;

use bridge::BridgeEmitter;
use downstream::{DownstreamWalker, VisitedPipelines};
use filter::ExclusionSet;
use job::JobEmitter;
use metrics::MetricsExporter;
use pipeline::TraceHierarchyBuilder;
use span::{EmitOptions, PipelineRef};

pub use summary::{MetricsSummary, TraceSummary};

/// Exports the configured pipeline as one trace.
///
/// Project and pipeline lookups and the root job/bridge listing are fatal.
/// Everything after the root span is opened is handled per entity, and the
/// root span is closed even when children fail.
pub async fn export_trace<A: CiApi>(
    api: &A,
    telemetry: &dyn Telemetry,
    config: &ExporterConfig,
    env_attributes: FlatAttributeMap,
) -> Result<TraceSummary> {
    let project_id = config.project_id.as_str();
    let pipeline_id = config.pipeline_id.ok_or_else(|| {
        ExporterError::MissingConfig(vec!["CI_PARENT_PIPELINE".to_string()])
    })?;

    let project = api.get_project(project_id).await?;
    let service_name = service_name(
        project.fields(),
        config.take_namespace_slug,
        &config.service_name,
    );
    let pipeline = api.get_pipeline(project_id, pipeline_id).await?;

    info!("Exporting pipeline {pipeline_id} of project {project_id} as '{service_name}'");

    let options = EmitOptions {
        service_name: service_name.clone(),
        low_data_mode: config.low_data_mode,
        export_logs: config.export_logs,
        env_attributes,
        flattener: config.flattener(),
    };
    let exclusions = ExclusionSet::new(&config.exclude_jobs);

    let mut summary = TraceSummary {
        project_id: project_id.to_string(),
        pipeline_id,
        service_name,
        ..TraceSummary::default()
    };

    let builder = TraceHierarchyBuilder::new(api, telemetry, &options, &exclusions);
    let Some(trace) = builder.process(project_id, &pipeline, &mut summary).await? else {
        info!("Nothing to export for pipeline {pipeline_id}");
        return Ok(summary);
    };
    summary.exported = true;

    let root = PipelineRef {
        project_id,
        pipeline_id,
    };
    JobEmitter::new(api, telemetry, &options)
        .process(
            root,
            &trace.jobs,
            trace.context,
            &mut summary.jobs,
            &mut summary.log_lines,
        )
        .await;
    BridgeEmitter::new(telemetry, &options).process(
        root,
        &trace.bridges,
        trace.context,
        &mut summary.bridges,
    );

    let mut visited = VisitedPipelines::new();
    if let Some(root_project) = project.id().or_else(|| project_id.parse().ok()) {
        visited.insert(root_project, pipeline_id);
    }
    let mut walker = DownstreamWalker::new(
        api,
        telemetry,
        &options,
        &exclusions,
        config.max_downstream_depth,
        visited,
    );
    for downstream in trace.bridges.iter().filter_map(|b| b.downstream()) {
        walker
            .walk(&downstream, trace.context, 0, &mut summary)
            .await;
    }

    trace.span.finish();

    info!(
        "Exported pipeline {pipeline_id}: {} jobs, {} bridges, {} downstream pipelines",
        summary.jobs.emitted, summary.bridges.emitted, summary.downstream.visited
    );
    Ok(summary)
}

/// Exports metrics and resource log events for the configured project, or
/// for every project selected through `export_paths`.
pub async fn export_metrics<A: CiApi>(
    api: &A,
    telemetry: &dyn Telemetry,
    config: &ExporterConfig,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<MetricsSummary> {
    MetricsExporter::new(api, telemetry, config).run(now).await
}
