use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfig(Vec<String>),

    #[error("GitLab API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("GitLab API error (status {status}) after {retries} retries")]
    ApiErrorAfterRetries { status: u16, retries: u32 },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Malformed {kind} record: {reason}")]
    MalformedRecord { kind: &'static str, reason: String },

    #[error("Invalid timestamp '{value}' in field '{field}'")]
    InvalidTimestamp { field: String, value: String },

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExporterError>;
