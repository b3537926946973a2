use serde::Serialize;

/// What happened to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Emitted,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub emitted: usize,
    pub skipped: usize,
    pub excluded: usize,
    pub failed: usize,
}

impl EntityStats {
    pub fn record(&mut self, outcome: EntityOutcome) {
        match outcome {
            EntityOutcome::Emitted => self.emitted += 1,
            EntityOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &EntityStats) {
        self.emitted += other.emitted;
        self.skipped += other.skipped;
        self.excluded += other.excluded;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownstreamStats {
    pub visited: usize,
    pub unreachable: usize,
    pub depth_limited: usize,
}

/// Job log lines exported as log records, split by severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogLineStats {
    pub info: usize,
    pub error: usize,
}

/// Result of one `traces` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub project_id: String,
    pub pipeline_id: u64,
    pub service_name: String,
    /// False when every job and bridge was excluded and nothing was sent
    pub exported: bool,
    pub jobs: EntityStats,
    pub bridges: EntityStats,
    pub downstream: DownstreamStats,
    pub log_lines: LogLineStats,
}

/// A project the `metrics` command exported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub project_id: String,
    pub service_name: String,
}

/// Log events sent for project resources other than pipelines and jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceEventStats {
    pub environments: EntityStats,
    pub deployments: EntityStats,
    pub releases: EntityStats,
    pub runners: EntityStats,
}

/// Result of one `metrics` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub window_minutes: u64,
    pub projects: Vec<ProjectSummary>,
    pub projects_failed: usize,
    pub pipelines: EntityStats,
    pub jobs: EntityStats,
    pub events: ResourceEventStats,
    /// DORA counter data points
    pub dora: EntityStats,
}
