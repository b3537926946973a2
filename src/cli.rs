use anyhow::Result;
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;

use crate::attributes::environment_attributes;
use crate::config::{split_list, ExporterConfig, RunMode, Settings};
use crate::exporter;
use crate::providers::GitLabClient;
use crate::telemetry::OtlpTelemetry;

#[derive(Parser)]
#[command(name = "gitlab-otel-exporter")]
#[command(author, version, about = "Exports GitLab CI/CD pipelines as OpenTelemetry traces, logs and metrics", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML, JSON or YAML); defaults to ./gitlab-exporter.{toml,json,yaml,yml}
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write the run summary here instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export one pipeline and its downstream pipelines as a trace
    Traces(ExportArgs),

    /// Export duration metrics for recently updated pipelines
    Metrics(ExportArgs),
}

#[derive(Args, Debug, Clone)]
struct ExportArgs {
    #[arg(long, env = "GLAB_TOKEN", hide_env_values = true)]
    gitlab_token: Option<String>,

    #[arg(long, env = "GLAB_ENDPOINT")]
    gitlab_endpoint: Option<String>,

    #[arg(long, env = "NEW_RELIC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "OTEL_EXPORTER_OTEL_ENDPOINT")]
    otel_endpoint: Option<String>,

    #[arg(short = 'P', long, env = "CI_PROJECT_ID")]
    project_id: Option<String>,

    #[arg(long, env = "CI_PARENT_PIPELINE")]
    pipeline_id: Option<u64>,

    #[arg(long, env = "CI_PIPELINE_ID", hide = true)]
    ci_pipeline_id: Option<u64>,

    #[arg(long, env = "GLAB_SERVICE_NAME")]
    service_name: Option<String>,

    #[arg(long, env = "GLAB_EXPORT_LOGS", value_parser = BoolishValueParser::new())]
    export_logs: Option<bool>,

    #[arg(long, env = "GLAB_LOW_DATA_MODE", value_parser = BoolishValueParser::new())]
    low_data_mode: Option<bool>,

    /// Comma-separated job, bridge or stage names
    #[arg(long, env = "GLAB_EXCLUDE_JOBS")]
    exclude_jobs: Option<String>,

    #[arg(long, env = "GLAB_ATTRIBUTES_DROP")]
    attributes_drop: Option<String>,

    #[arg(long, env = "GLAB_ENVS_DROP")]
    envs_drop: Option<String>,

    #[arg(long, env = "GLAB_DIMENSION_METRICS")]
    dimension_metrics: Option<String>,

    #[arg(long, env = "GLAB_CONVERT_TO_TIMESTAMP", value_parser = BoolishValueParser::new())]
    convert_to_timestamp: Option<bool>,

    #[arg(long, env = "GLAB_MAX_DOWNSTREAM_DEPTH")]
    max_downstream_depth: Option<usize>,

    #[arg(long, env = "GLAB_TAKE_NAMESPACE_SLUG", value_parser = BoolishValueParser::new())]
    take_namespace_slug: Option<bool>,

    #[arg(long, env = "GLAB_EXPORT_LAST_MINUTES")]
    export_last_minutes: Option<u64>,

    #[arg(long, env = "GLAB_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Comma-separated group paths whose projects `metrics` exports
    #[arg(long, env = "GLAB_EXPORT_PATHS")]
    export_paths: Option<String>,

    #[arg(long, env = "GLAB_EXPORT_PROJECTS_REGEX")]
    export_projects_regex: Option<String>,

    #[arg(long, env = "GLAB_DORA_METRICS", value_parser = BoolishValueParser::new())]
    dora_metrics: Option<bool>,
}

impl ExportArgs {
    fn into_settings(self) -> Settings {
        let list = |raw: Option<String>| raw.map(|r| split_list(&r));

        Settings {
            gitlab_token: self.gitlab_token,
            gitlab_endpoint: self.gitlab_endpoint,
            api_key: self.api_key,
            otel_endpoint: self.otel_endpoint,
            project_id: self.project_id,
            pipeline_id: self.pipeline_id,
            ci_pipeline_id: self.ci_pipeline_id,
            service_name: self.service_name,
            export_logs: self.export_logs,
            low_data_mode: self.low_data_mode,
            exclude_jobs: list(self.exclude_jobs),
            attributes_drop: list(self.attributes_drop),
            envs_drop: list(self.envs_drop),
            dimension_metrics: list(self.dimension_metrics),
            convert_to_timestamp: self.convert_to_timestamp,
            max_downstream_depth: self.max_downstream_depth,
            take_namespace_slug: self.take_namespace_slug,
            export_last_minutes: self.export_last_minutes,
            max_concurrency: self.max_concurrency,
            export_paths: list(self.export_paths),
            export_projects_regex: self.export_projects_regex,
            dora_metrics: self.dora_metrics,
        }
    }
}

impl Cli {
    /// Settings file first, then flags and environment variables on top.
    fn resolve(&self, args: &ExportArgs, mode: RunMode) -> Result<ExporterConfig> {
        let settings = Settings::load(self.config.as_deref())?.overlay(args.clone().into_settings());
        Ok(ExporterConfig::from_settings(settings, mode)?)
    }

    fn write_summary<T: Serialize>(&self, summary: &T) -> Result<()> {
        let json_output = if self.pretty {
            serde_json::to_string_pretty(summary)?
        } else {
            serde_json::to_string(summary)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output)?;
            info!("Summary written to: {}", output_path.display());
        } else {
            println!("{json_output}");
        }

        Ok(())
    }

    async fn execute_traces(&self, args: &ExportArgs) -> Result<()> {
        let config = self.resolve(args, RunMode::Traces)?;
        info!("Exporting traces for project: {}", config.project_id);

        let client = GitLabClient::new(&config.gitlab_endpoint, config.gitlab_token.clone())?;
        let telemetry = OtlpTelemetry::new(&config.otel_endpoint, &config.api_key);
        let env_attributes = environment_attributes(std::env::vars(), &config.envs_drop);

        let summary = exporter::export_trace(&client, &telemetry, &config, env_attributes).await?;
        self.write_summary(&summary)
    }

    async fn execute_metrics(&self, args: &ExportArgs) -> Result<()> {
        let config = self.resolve(args, RunMode::Metrics)?;
        if config.export_paths.is_empty() {
            info!("Exporting metrics for project: {}", config.project_id);
        } else {
            info!("Exporting metrics for projects under: {}", config.export_paths.join(", "));
        }

        let client = GitLabClient::new(&config.gitlab_endpoint, config.gitlab_token.clone())?;
        let telemetry = OtlpTelemetry::new(&config.otel_endpoint, &config.api_key);

        let summary =
            exporter::export_metrics(&client, &telemetry, &config, chrono::Utc::now()).await?;
        self.write_summary(&summary)
    }

    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Traces(args) => self.execute_traces(args).await,
            Commands::Metrics(args) => self.execute_metrics(args).await,
        }
    }
}
