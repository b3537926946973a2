use anyhow::{Context, Result};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::attributes::AttributeFlattener;
use crate::auth::Token;
use crate::error::ExporterError;

const DEFAULT_GITLAB_ENDPOINT: &str = "https://gitlab.com/";
const US_OTLP_ENDPOINT: &str = "https://otlp.nr-data.net:4318";
const EU_OTLP_ENDPOINT: &str = "https://otlp.eu01.nr-data.net:4318";
const DEFAULT_SERVICE_NAME: &str = "gitlab-exporter";
const DEFAULT_MAX_DOWNSTREAM_DEPTH: usize = 3;
const DEFAULT_EXPORT_LAST_MINUTES: u64 = 60;
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Optional settings, as read from a settings file or collected from
/// command-line flags and environment variables.
///
/// Every field is optional so layers can be overlaid; `ExporterConfig`
/// applies the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// GitLab API token (`GLAB_TOKEN`)
    pub gitlab_token: Option<String>,

    /// GitLab instance base URL
    pub gitlab_endpoint: Option<String>,

    /// Telemetry backend ingest key (`NEW_RELIC_API_KEY`)
    pub api_key: Option<String>,

    /// OTLP/HTTP endpoint; derived from the API key region when unset
    pub otel_endpoint: Option<String>,

    /// Project id or path whose pipeline is exported
    pub project_id: Option<String>,

    /// Pipeline exported by the `traces` command
    pub pipeline_id: Option<u64>,

    /// Pipeline running the exporter (`CI_PIPELINE_ID`); used only when no
    /// layer sets `pipeline_id`
    pub ci_pipeline_id: Option<u64>,

    /// Service name used when the project carries no name
    pub service_name: Option<String>,

    pub export_logs: Option<bool>,
    pub low_data_mode: Option<bool>,
    pub exclude_jobs: Option<Vec<String>>,
    pub attributes_drop: Option<Vec<String>>,
    pub envs_drop: Option<Vec<String>>,
    pub dimension_metrics: Option<Vec<String>>,
    pub convert_to_timestamp: Option<bool>,
    pub max_downstream_depth: Option<usize>,
    pub take_namespace_slug: Option<bool>,
    pub export_last_minutes: Option<u64>,
    pub max_concurrency: Option<usize>,

    /// Group paths whose projects the `metrics` command exports
    pub export_paths: Option<Vec<String>>,

    /// Only projects whose name matches are exported from `export_paths`
    pub export_projects_regex: Option<String>,

    pub dora_metrics: Option<bool>,
}

impl Settings {
    /// Load settings from a file.
    ///
    /// Searches for settings files in this order:
    /// 1. Specified path
    /// 2. ./gitlab-exporter.toml
    /// 3. ./gitlab-exporter.json
    /// 4. ./gitlab-exporter.yaml
    /// 5. ./gitlab-exporter.yml
    ///
    /// Returns empty settings if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = [
            "gitlab-exporter.toml",
            "gitlab-exporter.json",
            "gitlab-exporter.yaml",
            "gitlab-exporter.yml",
        ];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load settings from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML settings: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON settings: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML settings: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse settings file: {}", path.display())),
        }
    }

    /// Overlays `other` on top of `self`; values set in `other` win.
    pub fn overlay(self, other: Settings) -> Settings {
        Settings {
            gitlab_token: other.gitlab_token.or(self.gitlab_token),
            gitlab_endpoint: other.gitlab_endpoint.or(self.gitlab_endpoint),
            api_key: other.api_key.or(self.api_key),
            otel_endpoint: other.otel_endpoint.or(self.otel_endpoint),
            project_id: other.project_id.or(self.project_id),
            pipeline_id: other.pipeline_id.or(self.pipeline_id),
            ci_pipeline_id: other.ci_pipeline_id.or(self.ci_pipeline_id),
            service_name: other.service_name.or(self.service_name),
            export_logs: other.export_logs.or(self.export_logs),
            low_data_mode: other.low_data_mode.or(self.low_data_mode),
            exclude_jobs: other.exclude_jobs.or(self.exclude_jobs),
            attributes_drop: other.attributes_drop.or(self.attributes_drop),
            envs_drop: other.envs_drop.or(self.envs_drop),
            dimension_metrics: other.dimension_metrics.or(self.dimension_metrics),
            convert_to_timestamp: other.convert_to_timestamp.or(self.convert_to_timestamp),
            max_downstream_depth: other.max_downstream_depth.or(self.max_downstream_depth),
            take_namespace_slug: other.take_namespace_slug.or(self.take_namespace_slug),
            export_last_minutes: other.export_last_minutes.or(self.export_last_minutes),
            max_concurrency: other.max_concurrency.or(self.max_concurrency),
            export_paths: other.export_paths.or(self.export_paths),
            export_projects_regex: other.export_projects_regex.or(self.export_projects_regex),
            dora_metrics: other.dora_metrics.or(self.dora_metrics),
        }
    }
}

/// Which command the configuration is resolved for; decides what is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Traces,
    Metrics,
}

/// Fully resolved, immutable exporter configuration.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub gitlab_token: Token,
    pub gitlab_endpoint: String,
    pub api_key: Token,
    pub otel_endpoint: String,
    /// Empty in `RunMode::Metrics` when `export_paths` selects the projects
    pub project_id: String,
    /// Always set in `RunMode::Traces`
    pub pipeline_id: Option<u64>,
    pub service_name: String,
    pub export_logs: bool,
    pub low_data_mode: bool,
    pub exclude_jobs: Vec<String>,
    pub attributes_drop: HashSet<String>,
    pub envs_drop: HashSet<String>,
    pub dimension_metrics: Vec<String>,
    pub convert_to_timestamp: bool,
    pub max_downstream_depth: usize,
    pub take_namespace_slug: bool,
    pub export_last_minutes: u64,
    pub max_concurrency: usize,
    pub export_paths: Vec<String>,
    pub export_projects_regex: Option<Regex>,
    pub dora_metrics: bool,
}

impl ExporterConfig {
    /// Applies defaults and validates required inputs.
    ///
    /// Every missing required input is reported at once.
    pub fn from_settings(settings: Settings, mode: RunMode) -> Result<Self, ExporterError> {
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let gitlab_token = present(settings.gitlab_token);
        let api_key = present(settings.api_key);
        let project_id = present(settings.project_id);
        let pipeline_id = settings.pipeline_id.or(settings.ci_pipeline_id);
        let export_paths = normalize_list(settings.export_paths.unwrap_or_default());
        let selects_projects = mode == RunMode::Metrics && !export_paths.is_empty();

        let mut missing = Vec::new();
        if gitlab_token.is_none() {
            missing.push("GLAB_TOKEN".to_string());
        }
        if api_key.is_none() {
            missing.push("NEW_RELIC_API_KEY".to_string());
        }
        if project_id.is_none() && !selects_projects {
            missing.push("CI_PROJECT_ID".to_string());
        }
        if mode == RunMode::Traces && pipeline_id.is_none() {
            missing.push("CI_PARENT_PIPELINE".to_string());
        }

        let (Some(gitlab_token), Some(api_key), true) =
            (gitlab_token, api_key, missing.is_empty())
        else {
            return Err(ExporterError::MissingConfig(missing));
        };
        let project_id = project_id.unwrap_or_default();

        let export_projects_regex = present(settings.export_projects_regex)
            .map(|pattern| {
                Regex::new(&pattern).map_err(|e| {
                    ExporterError::Config(format!("invalid GLAB_EXPORT_PROJECTS_REGEX: {e}"))
                })
            })
            .transpose()?;

        let otel_endpoint = present(settings.otel_endpoint)
            .unwrap_or_else(|| default_otel_endpoint(&api_key).to_string());

        let max_concurrency = settings.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            return Err(ExporterError::Config(
                "max-concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            gitlab_token: Token::from(gitlab_token),
            gitlab_endpoint: present(settings.gitlab_endpoint)
                .unwrap_or_else(|| DEFAULT_GITLAB_ENDPOINT.to_string()),
            api_key: Token::from(api_key),
            otel_endpoint,
            project_id,
            pipeline_id,
            service_name: present(settings.service_name)
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            export_logs: settings.export_logs.unwrap_or(true),
            low_data_mode: settings.low_data_mode.unwrap_or(false),
            exclude_jobs: normalize_list(settings.exclude_jobs.unwrap_or_default()),
            attributes_drop: parse_drop_list(
                settings.attributes_drop.unwrap_or_default(),
                DropListKind::Attributes,
            ),
            envs_drop: parse_drop_list(
                settings.envs_drop.unwrap_or_default(),
                DropListKind::Environment,
            ),
            dimension_metrics: normalize_list(settings.dimension_metrics.unwrap_or_default()),
            convert_to_timestamp: settings.convert_to_timestamp.unwrap_or(false),
            max_downstream_depth: settings
                .max_downstream_depth
                .unwrap_or(DEFAULT_MAX_DOWNSTREAM_DEPTH),
            take_namespace_slug: settings.take_namespace_slug.unwrap_or(false),
            export_last_minutes: settings
                .export_last_minutes
                .unwrap_or(DEFAULT_EXPORT_LAST_MINUTES),
            max_concurrency,
            export_paths,
            export_projects_regex,
            dora_metrics: settings.dora_metrics.unwrap_or(false),
        })
    }

    pub fn flattener(&self) -> AttributeFlattener {
        AttributeFlattener::new(self.attributes_drop.clone(), self.convert_to_timestamp)
    }
}

fn default_otel_endpoint(api_key: &str) -> &'static str {
    if api_key.to_lowercase().starts_with("eu") {
        EU_OTLP_ENDPOINT
    } else {
        US_OTLP_ENDPOINT
    }
}

/// Splits comma-separated values; `GLAB_EXCLUDE_JOBS=a,b` arrives as one entry.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_list(entries: Vec<String>) -> Vec<String> {
    entries.iter().flat_map(|e| split_list(e)).collect()
}

#[derive(Debug, Clone, Copy)]
enum DropListKind {
    Attributes,
    Environment,
}

/// Parses a drop-list. One malformed entry invalidates the whole list, which
/// then drops nothing extra.
fn parse_drop_list(entries: Vec<String>, kind: DropListKind) -> HashSet<String> {
    let (pattern, name) = match kind {
        DropListKind::Attributes => (r"^[a-z0-9_.\-\[\]]+$", "GLAB_ATTRIBUTES_DROP"),
        DropListKind::Environment => (r"^[A-Za-z_][A-Za-z0-9_]*$", "GLAB_ENVS_DROP"),
    };
    let Ok(valid) = Regex::new(pattern) else {
        return HashSet::new();
    };

    let entries: Vec<String> = normalize_list(entries)
        .into_iter()
        .map(|e| match kind {
            DropListKind::Attributes => e.to_lowercase(),
            DropListKind::Environment => e,
        })
        .collect();

    if let Some(invalid) = entries.iter().find(|e| !valid.is_match(e)) {
        warn!("Ignoring {name}: invalid entry '{invalid}', no extra values will be dropped");
        return HashSet::new();
    }

    entries.into_iter().collect()
}
