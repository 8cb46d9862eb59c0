//! HTTP clients for the external platforms.
//!
//! Each client implements one of the narrow source traits consumed by the
//! connectors or the discovery layer. Transient failures (429, 5xx,
//! connection errors) are retried here with bounded exponential backoff;
//! anything that survives the retries is surfaced to the caller.

pub mod github;
pub mod google;
pub mod slack;

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{RequestBuilder, Response, StatusCode};

pub const USER_AGENT: &str = concat!("issue-enhancer/", env!("CARGO_PKG_VERSION"));

const MAX_ATTEMPTS: u32 = 4;
const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_DELAY))
}

/// Send a request built by `build`, retrying transient failures.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed
/// by sending it.
pub async fn send_with_retry<F>(what: &str, build: F) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    send_retrying(what, build)
        .await?
        .error_for_status()
        .with_context(|| format!("{} returned error status", what))
}

/// Like [`send_with_retry`], but hands back the final response without
/// checking its status, for callers that give some statuses a meaning.
pub async fn send_retrying<F>(what: &str, mut build: F) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match build().send().await {
            Ok(resp) if is_retryable(resp.status()) && attempt < MAX_ATTEMPTS => {
                let delay = retry_after(&resp).unwrap_or_else(|| backoff(attempt));
                tracing::warn!(
                    request = what,
                    status = %resp.status(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient upstream failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Ok(resp) => return Ok(resp),
            Err(e) if (e.is_timeout() || e.is_connect()) && attempt < MAX_ATTEMPTS => {
                let delay = backoff(attempt);
                tracing::warn!(request = what, error = %e, attempt, "Request failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to send {} request", what));
            }
        }
    }
}
