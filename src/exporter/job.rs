use std::sync::LazyLock;

use log::{debug, error, warn};
use regex::Regex;

use super::span::{require_id, EmitOptions, EntityTiming, PipelineRef};
use super::summary::{EntityOutcome, EntityStats, LogLineStats};
use crate::error::Result;
use crate::providers::{CiApi, ExecutionRecord};
use crate::telemetry::{
    RecordLogger, Severity, SpanContext, SpanKind, SpanStatus, Telemetry,
};

const FAILURE_MARKER: &str = "ERROR: Job failed: ";

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap()
});

fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// The text after the last failure marker of a job log, up to the end of
/// that line.
fn failure_message_from_log(log: &str) -> Option<String> {
    let (_, tail) = log.rsplit_once(FAILURE_MARKER)?;
    let message = tail.lines().next().unwrap_or_default().trim();
    (!message.is_empty()).then(|| message.to_string())
}

/// Emits one span per job, parented to the pipeline span, and exports job
/// logs as log records.
pub struct JobEmitter<'a, A> {
    api: &'a A,
    telemetry: &'a dyn Telemetry,
    options: &'a EmitOptions,
}

impl<'a, A: CiApi> JobEmitter<'a, A> {
    pub fn new(api: &'a A, telemetry: &'a dyn Telemetry, options: &'a EmitOptions) -> Self {
        Self {
            api,
            telemetry,
            options,
        }
    }

    /// Emits every job. A job that fails to emit is logged and counted; it
    /// never stops its siblings.
    pub async fn process(
        &self,
        pipeline: PipelineRef<'_>,
        jobs: &[ExecutionRecord],
        parent: SpanContext,
        stats: &mut EntityStats,
        log_lines: &mut LogLineStats,
    ) {
        for job in jobs {
            match self.emit(pipeline, job, parent, log_lines).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    error!(
                        "Failed to export job {} ('{}') of pipeline {}: {e}",
                        job.id().map_or_else(|| "?".to_string(), |id| id.to_string()),
                        job.name(),
                        pipeline.pipeline_id
                    );
                    stats.failed += 1;
                }
            }
        }
    }

    async fn emit(
        &self,
        pipeline: PipelineRef<'_>,
        job: &ExecutionRecord,
        parent: SpanContext,
        log_lines: &mut LogLineStats,
    ) -> Result<EntityOutcome> {
        let id = require_id(job, "job")?;
        let timing = EntityTiming::of(job)?;
        let flat = self.options.flattener.flatten(job.fields());
        let resource = self.options.entity_resource(pipeline, "job_id", id, &flat);
        let tracer = self.telemetry.tracer(&resource)?;

        let name = format!("Stage: {} - job_id: {id}", job.name());

        if job.is_skipped() {
            debug!("Job {id} was skipped");
            let span = tracer.start_span(
                &format!("{name} - SKIPPED"),
                Some(parent),
                timing.start,
                SpanKind::Consumer,
            );
            span.end(timing.end);
            return Ok(EntityOutcome::Skipped);
        }

        let mut span = tracer.start_span(&name, Some(parent), timing.start, SpanKind::Consumer);
        span.set_attributes(self.options.entity_attributes(&flat));

        if job.is_failed() {
            let message = self.failure_message(pipeline.project_id, id, job).await;
            span.set_status(SpanStatus::Error(message));
        } else if self.options.export_logs {
            match self.telemetry.logger(&resource) {
                Ok(logger) => {
                    self.export_log(pipeline.project_id, id, logger.as_ref(), log_lines)
                        .await;
                }
                Err(e) => warn!("Skipping logs of job {id}: {e}"),
            }
        }

        span.end(timing.end);
        Ok(EntityOutcome::Emitted)
    }

    async fn failure_message(&self, project_id: &str, job_id: u64, job: &ExecutionRecord) -> String {
        let from_log = match self.api.download_log(project_id, job_id).await {
            Ok(bytes) => failure_message_from_log(&strip_ansi(&String::from_utf8_lossy(&bytes))),
            Err(e) => {
                warn!("Could not download log of failed job {job_id}: {e}");
                None
            }
        };

        from_log
            .or_else(|| job.failure_reason().map(str::to_string))
            .unwrap_or_else(|| "Job failed".to_string())
    }

    /// One log record per non-blank line; lines mentioning an error are
    /// emitted at ERROR severity.
    async fn export_log(
        &self,
        project_id: &str,
        job_id: u64,
        logger: &dyn RecordLogger,
        log_lines: &mut LogLineStats,
    ) {
        let bytes = match self.api.download_log(project_id, job_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not download log of job {job_id}: {e}");
                return;
            }
        };

        let text = strip_ansi(&String::from_utf8_lossy(&bytes));
        for line in text.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
            if line.to_lowercase().contains("error") {
                logger.emit(Severity::Error, line);
                log_lines.error += 1;
            } else {
                logger.emit(Severity::Info, line);
                log_lines.info += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeFlattener, FlatAttributeMap};
    use crate::providers::gitlab::fake::{record, FakeCiApi};
    use crate::telemetry::recording::RecordingTelemetry;
    use serde_json::json;

    const PIPELINE: PipelineRef<'static> = PipelineRef {
        project_id: "42",
        pipeline_id: 1000,
    };

    const ROOT: SpanContext = SpanContext {
        trace_id: 99,
        span_id: 99,
    };

    fn options() -> EmitOptions {
        EmitOptions {
            service_name: "group/project".to_string(),
            low_data_mode: false,
            export_logs: true,
            env_attributes: FlatAttributeMap::new(),
            flattener: AttributeFlattener::default(),
        }
    }

    async fn run(api: &FakeCiApi, options: &EmitOptions, jobs: Vec<serde_json::Value>)
        -> (RecordingTelemetry, EntityStats, LogLineStats)
    {
        let telemetry = RecordingTelemetry::new();
        let jobs: Vec<_> = jobs.into_iter().map(record).collect();
        let mut stats = EntityStats::default();
        let mut lines = LogLineStats::default();

        JobEmitter::new(api, &telemetry, options)
            .process(PIPELINE, &jobs, ROOT, &mut stats, &mut lines)
            .await;

        (telemetry, stats, lines)
    }

    mod failure_message_from_log {
        use super::*;

        #[test]
        fn test_takes_text_after_last_marker() {
            let log = "ERROR: Job failed: first\nretry\nERROR: Job failed: exit code 2\nsection_end";
            assert_eq!(failure_message_from_log(log), Some("exit code 2".to_string()));
        }

        #[test]
        fn test_missing_or_empty_marker() {
            assert_eq!(failure_message_from_log("all good"), None);
            assert_eq!(failure_message_from_log("ERROR: Job failed: \n"), None);
        }

        #[test]
        fn test_ansi_codes_are_stripped_first() {
            let log = strip_ansi("\x1b[31;1mERROR: Job failed: exit code 1\x1b[0;m\n");
            assert_eq!(failure_message_from_log(&log), Some("exit code 1".to_string()));
        }
    }

    mod process {
        use super::*;

        #[tokio::test]
        async fn test_successful_job_span() {
            let api = FakeCiApi::new().with_log("42", 2, "");
            let (telemetry, stats, _) = run(
                &api,
                &options(),
                vec![json!({
                    "id": 2,
                    "name": "build",
                    "stage": "compile",
                    "status": "success",
                    "started_at": "2024-01-01T10:00:00Z",
                    "finished_at": "2024-01-01T10:05:00Z"
                })],
            )
            .await;

            let span = telemetry.span("Stage: build - job_id: 2");
            assert_eq!(span.kind, SpanKind::Consumer);
            assert_eq!(span.parent, Some(ROOT));
            assert_eq!(span.status, SpanStatus::Unset);
            assert_eq!(span.start.unwrap().to_rfc3339(), "2024-01-01T10:00:00+00:00");
            assert_eq!(span.end.unwrap().to_rfc3339(), "2024-01-01T10:05:00+00:00");
            assert_eq!(span.attributes["stage"], "compile");
            assert_eq!(span.resource["job_id"], "2");
            assert_eq!(span.resource["resource.name"], "build");
            assert_eq!(stats.emitted, 1);
        }

        #[tokio::test]
        async fn test_failed_job_uses_log_marker() {
            let api = FakeCiApi::new().with_log(
                "42",
                2,
                "$ make\nmake: *** [all] Error 2\nERROR: Job failed: exit code 2\n",
            );
            let (telemetry, _, lines) = run(
                &api,
                &options(),
                vec![json!({
                    "id": 2, "name": "build", "status": "failed",
                    "failure_reason": "script_failure"
                })],
            )
            .await;

            assert_eq!(
                telemetry.span("Stage: build - job_id: 2").status,
                SpanStatus::Error("exit code 2".to_string())
            );
            assert!(telemetry.logs().is_empty(), "failed job logs are not exported");
            assert_eq!(lines, LogLineStats::default());
        }

        #[tokio::test]
        async fn test_failed_job_falls_back_to_failure_reason() {
            let api = FakeCiApi::new().with_log("42", 2, "no marker here\n");
            let (telemetry, _, _) = run(
                &api,
                &options(),
                vec![json!({
                    "id": 2, "name": "build", "status": "failed",
                    "failure_reason": "script_failure"
                })],
            )
            .await;

            assert_eq!(
                telemetry.span("Stage: build - job_id: 2").status,
                SpanStatus::Error("script_failure".to_string())
            );
        }

        #[tokio::test]
        async fn test_failed_job_without_log_or_reason() {
            let api = FakeCiApi::new();
            let (telemetry, stats, _) = run(
                &api,
                &options(),
                vec![json!({ "id": 2, "name": "build", "status": "failed" })],
            )
            .await;

            assert_eq!(
                telemetry.span("Stage: build - job_id: 2").status,
                SpanStatus::Error("Job failed".to_string())
            );
            assert_eq!(stats.emitted, 1);
        }

        #[tokio::test]
        async fn test_skipped_job_has_no_attributes_or_duration() {
            let api = FakeCiApi::new();
            let (telemetry, stats, _) = run(
                &api,
                &options(),
                vec![json!({
                    "id": 3, "name": "deploy", "status": "skipped",
                    "created_at": "2024-01-01T10:00:00Z"
                })],
            )
            .await;

            let span = telemetry.span("Stage: deploy - job_id: 3 - SKIPPED");
            assert!(span.ended);
            assert!(span.attributes.is_empty());
            assert_eq!(span.start, span.end);
            assert_eq!(stats.skipped, 1);
            assert!(api.calls().is_empty(), "skipped jobs never fetch logs");
        }

        #[tokio::test]
        async fn test_skipped_job_in_low_data_mode() {
            let api = FakeCiApi::new().with_log("42", 3, "never read\n");
            let options = EmitOptions {
                low_data_mode: true,
                env_attributes: [("CI_PIPELINE_ID".to_string(), "1000".to_string())]
                    .into_iter()
                    .collect(),
                ..options()
            };
            let (telemetry, stats, lines) = run(
                &api,
                &options,
                vec![json!({
                    "id": 3, "name": "deploy", "stage": "release", "status": "skipped",
                    "started_at": "2024-01-01T10:02:00Z",
                    "finished_at": "2024-01-01T10:09:00Z"
                })],
            )
            .await;

            let span = telemetry.span("Stage: deploy - job_id: 3 - SKIPPED");
            assert!(span.ended);
            assert!(span.attributes.is_empty());
            assert_eq!(span.start, span.end);
            assert_eq!(span.start.unwrap().to_rfc3339(), "2024-01-01T10:02:00+00:00");
            assert_eq!(stats.skipped, 1);
            assert!(telemetry.logs().is_empty());
            assert_eq!(lines, LogLineStats::default());
            assert!(!api.calls().iter().any(|c| c.starts_with("log ")));
        }

        #[tokio::test]
        async fn test_log_lines_become_records() {
            let api = FakeCiApi::new().with_log(
                "42",
                2,
                "\x1b[32mRunning tests\x1b[0m\n\n   \nerror: flaky test retried\ndone\n",
            );
            let (telemetry, _, lines) = run(
                &api,
                &options(),
                vec![json!({ "id": 2, "name": "test", "status": "success" })],
            )
            .await;

            let logs = telemetry.logs();
            let bodies: Vec<_> = logs.iter().map(|l| l.body.as_str()).collect();
            assert_eq!(bodies, vec!["Running tests", "error: flaky test retried", "done"]);
            assert_eq!(logs[1].severity, Severity::Error);
            assert_eq!(logs[0].resource["job_id"], "2");
            assert_eq!(lines, LogLineStats { info: 2, error: 1 });
        }

        #[tokio::test]
        async fn test_logs_disabled() {
            let api = FakeCiApi::new().with_log("42", 2, "line\n");
            let options = EmitOptions {
                export_logs: false,
                ..options()
            };
            let (telemetry, _, _) = run(
                &api,
                &options,
                vec![json!({ "id": 2, "name": "test", "status": "success" })],
            )
            .await;

            assert!(telemetry.logs().is_empty());
            assert!(api.calls().is_empty());
        }

        #[tokio::test]
        async fn test_low_data_mode_attaches_environment_only() {
            let api = FakeCiApi::new().with_log("42", 2, "");
            let options = EmitOptions {
                low_data_mode: true,
                env_attributes: [("CI_PIPELINE_ID".to_string(), "1000".to_string())]
                    .into_iter()
                    .collect(),
                ..options()
            };
            let (telemetry, _, _) = run(
                &api,
                &options,
                vec![json!({ "id": 2, "name": "test", "stage": "verify", "status": "success" })],
            )
            .await;

            let span = telemetry.span("Stage: test - job_id: 2");
            assert_eq!(span.attributes, options.env_attributes);
            assert!(!span.resource.contains_key("stage"));
        }

        #[tokio::test]
        async fn test_broken_job_does_not_stop_siblings() {
            let api = FakeCiApi::new().with_log("42", 5, "");
            let (telemetry, stats, _) = run(
                &api,
                &options(),
                vec![
                    json!({ "name": "no-id", "status": "success" }),
                    json!({ "id": 4, "name": "bad-time", "started_at": "yesterday" }),
                    json!({ "id": 5, "name": "good", "status": "success" }),
                ],
            )
            .await;

            assert_eq!(stats.failed, 2);
            assert_eq!(stats.emitted, 1);
            assert_eq!(telemetry.span_names(), vec!["Stage: good - job_id: 5"]);
        }

        #[tokio::test]
        async fn test_tracer_failure_is_counted() {
            let api = FakeCiApi::new();
            let telemetry = RecordingTelemetry::new();
            telemetry.fail_tracer_for("job_id", "2");
            let jobs = vec![record(json!({ "id": 2, "name": "build", "status": "success" }))];
            let mut stats = EntityStats::default();
            let mut lines = LogLineStats::default();

            JobEmitter::new(&api, &telemetry, &options())
                .process(PIPELINE, &jobs, ROOT, &mut stats, &mut lines)
                .await;

            assert_eq!(stats.failed, 1);
            assert!(telemetry.spans().is_empty());
        }
    }
}
