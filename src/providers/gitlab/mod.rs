mod api;
mod client;
#[cfg(test)]
pub mod fake;
mod types;

pub use api::CiApi;
pub use client::GitLabClient;
pub use types::{DoraMetric, DownstreamRef, ExecutionRecord};
