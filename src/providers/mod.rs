pub mod appveyor;
pub mod azure;
pub mod circleci;
pub mod github;
pub mod gitlab;
pub mod travis;

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{CiwatchError, Result};
use crate::models::{Commit, Pipeline, PipelineKey};
use crate::ratelimit::RateLimiter;
use crate::utils;

/// A backend able to resolve git references to commits for a repository.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Resolves `reference` (branch, tag or SHA) to a commit, or
    /// `UnknownRef` when the backend does not know it.
    async fn commit(&self, repository_url: &str, reference: &str) -> Result<Commit>;

    /// Reference names offered as completions in the ref prompt.
    async fn references(&self, repository_url: &str) -> Result<Vec<String>>;
}

/// A CI backend that, given a commit, produces pipelines.
#[async_trait]
pub trait CiProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Host of the pipeline web URLs this provider can parse.
    fn host(&self) -> &str;

    /// Parses a vendor pipeline URL, fetches it and translates it, or
    /// fails with `UnknownUrl`.
    async fn build_from_url(&self, url: &str) -> Result<Pipeline>;

    /// All pipelines known to this provider for `(repository, sha)`.
    async fn pipelines(&self, repository_url: &str, sha: &str) -> Result<Vec<Pipeline>>;

    /// Raw log for the step addressed by `step_path` inside `key`, or
    /// `NoLogHere` when that node has no fetchable log.
    async fn log(&self, key: &PipelineKey, step_path: &[String]) -> Result<String>;
}

const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Sends a request through the provider's rate limiter, retrying
/// transient failures (429, 5xx, timeouts, connection errors) with
/// exponential backoff. Other 4xx statuses are permanent.
pub(crate) async fn send_with_retry(
    provider: &str,
    limiter: &RateLimiter,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let mut last_status = 0u16;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
            debug!("{provider}: retrying in {backoff:?} (attempt {attempt})");
            tokio::time::sleep(backoff).await;
        }

        limiter.acquire().await;

        let req = request
            .try_clone()
            .ok_or_else(|| CiwatchError::Config(format!("{provider}: request not retryable")))?;

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                last_status = status.as_u16();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!("{provider}: transient status {status}, retrying");
                    continue;
                }
                let message = response.text().await.unwrap_or_default();
                return Err(CiwatchError::Api {
                    provider: provider.to_string(),
                    status: last_status,
                    message: truncate_message(&message),
                });
            }
            Err(err) if err.is_timeout() || err.is_connect() => {
                warn!("{provider}: transient network error, retrying: {err}");
                continue;
            }
            Err(err) => return Err(CiwatchError::Network(err)),
        }
    }

    Err(CiwatchError::ApiAfterRetries {
        provider: provider.to_string(),
        status: last_status,
        retries: MAX_ATTEMPTS - 1,
    })
}

fn truncate_message(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default();
    line.chars().take(200).collect()
}

/// Builds the HTTP client every provider uses: identified user agent,
/// bounded request time.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("ciwatch/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| CiwatchError::Config(format!("Failed to build HTTP client: {e}")))
}

/// Maps a repository URL to the `owner/repo` slug this provider serves,
/// or `UnknownRepositoryUrl` when the URL lives on a different host.
/// The monitor skips such URLs silently.
pub(crate) fn slug_for_host(repository_url: &str, host: &str) -> Result<String> {
    match utils::repository_host(repository_url) {
        Some(h) if h == host => utils::repository_slug(repository_url),
        _ => Err(CiwatchError::UnknownRepositoryUrl(repository_url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_for_host_filters_foreign_remotes() {
        assert_eq!(
            slug_for_host("https://github.com/o/r.git", "github.com").unwrap(),
            "o/r"
        );
        assert!(matches!(
            slug_for_host("https://gitlab.com/o/r.git", "github.com"),
            Err(CiwatchError::UnknownRepositoryUrl(_))
        ));
    }

    #[test]
    fn test_truncate_message_keeps_first_line() {
        assert_eq!(truncate_message("oops\nmore"), "oops");
        let long = "x".repeat(400);
        assert_eq!(truncate_message(&long).len(), 200);
    }
}
