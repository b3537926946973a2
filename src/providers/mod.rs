pub mod gitlab;

pub use gitlab::{CiApi, DoraMetric, DownstreamRef, ExecutionRecord, GitLabClient};
