use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use log::{debug, info, warn};

use super::bridge::BridgeEmitter;
use super::filter::ExclusionSet;
use super::job::JobEmitter;
use super::span::{EmitOptions, PipelineRef};
use super::summary::TraceSummary;
use crate::error::Result;
use crate::providers::{CiApi, DownstreamRef, ExecutionRecord};
use crate::telemetry::{SpanContext, Telemetry};

/// `(project_id, pipeline_id)` pairs already walked in this pass.
///
/// Keys are only ever added, so pipeline cycles through bridges terminate.
#[derive(Debug, Default)]
pub struct VisitedPipelines(HashSet<(u64, u64)>);

impl VisitedPipelines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the key was already present.
    pub fn insert(&mut self, project_id: u64, pipeline_id: u64) -> bool {
        self.0.insert((project_id, pipeline_id))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Walks pipelines triggered by bridges and emits their jobs and bridges
/// under the root pipeline span.
///
/// Downstream pipelines get no span of their own; their entities hang off
/// the original root context.
pub struct DownstreamWalker<'a, A> {
    api: &'a A,
    telemetry: &'a dyn Telemetry,
    options: &'a EmitOptions,
    exclusions: &'a ExclusionSet,
    max_depth: usize,
    visited: VisitedPipelines,
}

impl<'a, A: CiApi> DownstreamWalker<'a, A> {
    pub fn new(
        api: &'a A,
        telemetry: &'a dyn Telemetry,
        options: &'a EmitOptions,
        exclusions: &'a ExclusionSet,
        max_depth: usize,
        visited: VisitedPipelines,
    ) -> Self {
        Self {
            api,
            telemetry,
            options,
            exclusions,
            max_depth,
            visited,
        }
    }

    #[cfg(test)]
    pub fn visited(&self) -> &VisitedPipelines {
        &self.visited
    }

    pub fn walk<'w>(
        &'w mut self,
        downstream: &'w DownstreamRef,
        parent: SpanContext,
        depth: usize,
        summary: &'w mut TraceSummary,
    ) -> Pin<Box<dyn Future<Output = ()> + 'w>> {
        Box::pin(async move {
            let (project_id, pipeline_id) = downstream.key();

            if depth >= self.max_depth {
                warn!(
                    "Not following downstream pipeline {project_id}/{pipeline_id}: depth limit {} reached",
                    self.max_depth
                );
                summary.downstream.depth_limited += 1;
                return;
            }
            if !self.visited.insert(project_id, pipeline_id) {
                debug!("Downstream pipeline {project_id}/{pipeline_id} already visited");
                return;
            }

            let project = project_id.to_string();
            let (jobs, bridges) = match self.fetch(&project, pipeline_id).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("Could not access downstream pipeline {project_id}/{pipeline_id}: {e}");
                    summary.downstream.unreachable += 1;
                    return;
                }
            };
            summary.downstream.visited += 1;

            let (jobs, excluded_jobs) = self.exclusions.filter(jobs);
            let (bridges, excluded_bridges) = self.exclusions.filter(bridges);
            summary.jobs.excluded += excluded_jobs;
            summary.bridges.excluded += excluded_bridges;

            info!(
                "Exporting downstream pipeline {project_id}/{pipeline_id} (depth {depth}): {} jobs, {} bridges",
                jobs.len(),
                bridges.len()
            );

            let pipeline = PipelineRef {
                project_id: &project,
                pipeline_id,
            };
            JobEmitter::new(self.api, self.telemetry, self.options)
                .process(pipeline, &jobs, parent, &mut summary.jobs, &mut summary.log_lines)
                .await;
            BridgeEmitter::new(self.telemetry, self.options).process(
                pipeline,
                &bridges,
                parent,
                &mut summary.bridges,
            );

            for next in bridges.iter().filter_map(|b| b.downstream()) {
                self.walk(&next, parent, depth + 1, summary).await;
            }
        })
    }

    async fn fetch(
        &self,
        project_id: &str,
        pipeline_id: u64,
    ) -> Result<(Vec<ExecutionRecord>, Vec<ExecutionRecord>)> {
        let jobs = self.api.list_jobs(project_id, pipeline_id).await?;
        let bridges = self.api.list_bridges(project_id, pipeline_id).await?;
        Ok((jobs, bridges))
    }
}
