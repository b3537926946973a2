use log::{debug, warn};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::auth::Token;
use crate::error::{ExporterError, Result};
use crate::providers::gitlab::types::ExecutionRecord;

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY_SECONDS: u64 = 10;
pub(super) const PAGE_SIZE: usize = 100;

pub struct GitLabClient {
    client: Client,
    api_url: Url,
    token: Token,
    max_retries: u32,
    retry_delay: Duration,
}

impl GitLabClient {
    pub fn new(base_url: &str, token: Token) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("gitlab-otel-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExporterError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut base = Url::parse(base_url)
            .map_err(|e| ExporterError::Config(format!("Invalid base URL: {e}")))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let api_url = base
            .join("api/v4/")
            .map_err(|e| ExporterError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            api_url,
            token,
            max_retries: MAX_RETRIES,
            retry_delay: Duration::from_secs(RETRY_DELAY_SECONDS),
        })
    }

    /// Overrides the retry budget for rate limits and transient failures.
    #[cfg(test)]
    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(self.token.as_str())
    }

    /// `api/v4/projects/<id>/<segments...>`, with the project id encoded as a
    /// single path segment so `group/project` paths work.
    pub(super) fn project_url(&self, project_id: &str, segments: &[&str]) -> Result<Url> {
        self.scoped_url("projects", project_id, segments)
    }

    /// `api/v4/groups/<path>/<segments...>`
    pub(super) fn group_url(&self, group_path: &str, segments: &[&str]) -> Result<Url> {
        self.scoped_url("groups", group_path, segments)
    }

    fn scoped_url(&self, scope: &str, id: &str, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| ExporterError::Config(format!("Invalid API base URL: {}", self.api_url)))?
            .pop_if_empty()
            .push(scope)
            .push(id)
            .extend(segments);
        Ok(url)
    }

    /// GET with automatic retry on network errors, rate limits and server
    /// errors. Any other non-success status is returned as `ExporterError::Api`.
    pub(super) async fn get_with_retry(&self, url: Url) -> Result<Response> {
        let mut retry_count = 0;
        loop {
            let request = self.auth_request(self.client.get(url.clone()));

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if retry_count >= self.max_retries {
                        return Err(e.into());
                    }
                    warn!(
                        "Network error ({}), retrying in {}s ({}/{})...",
                        e,
                        self.retry_delay.as_secs(),
                        retry_count + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status == 429 || status.is_server_error() {
                if retry_count >= self.max_retries {
                    return Err(ExporterError::ApiErrorAfterRetries {
                        status: status.as_u16(),
                        retries: self.max_retries,
                    });
                }

                warn!(
                    "GitLab API error (status {status}). Waiting {} seconds before retry {}/{}...",
                    self.retry_delay.as_secs(),
                    retry_count + 1,
                    self.max_retries
                );

                tokio::time::sleep(self.retry_delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                return Err(ExporterError::Api {
                    status: status.as_u16(),
                    message: error_text,
                });
            }

            return Ok(response);
        }
    }

    pub(super) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.get_with_retry(url).await?;
        Ok(response.json().await?)
    }

    /// Follows `x-next-page` until GitLab reports no further page.
    pub(super) async fn get_all_pages(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<Vec<ExecutionRecord>> {
        let mut records = Vec::new();
        let mut page = 1_u32;

        loop {
            let mut page_url = url.clone();
            page_url
                .query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())))
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());

            let response = self.get_with_retry(page_url).await?;
            let next_page = response
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok());

            let batch: Vec<ExecutionRecord> = response.json().await?;
            debug!("Fetched {} records from {} (page {page})", batch.len(), url.path());
            records.extend(batch);

            match next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        Ok(records)
    }
}
