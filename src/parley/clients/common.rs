//! Shared transport plumbing for provider clients.
//!
//! One pooled [`reqwest`] client serves every debate client in the process;
//! keeping TLS sessions and DNS lookups warm matters when a single debate
//! issues dozens of sequential calls.  The helpers here also pin down the
//! pieces every client shares: endpoint normalization, the retry backoff
//! schedule, and the bounded response-body read.

use crate::parley::client::LlmError;
use lazy_static::lazy_static;
use std::time::Duration;

/// Default endpoint when no base URL is configured.
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/responses";

/// Hard cap on response-body bytes.  Exceeding it fails the call outright;
/// an oversize body is never retried.
pub const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Normalize a configured base URL into the full completions endpoint.
///
/// Rules, in order: empty input yields [`DEFAULT_ENDPOINT`]; a `/responses`
/// suffix is preserved; a `/v1` suffix gets `/responses` appended; a path
/// already containing `/v1/` is used as-is; anything else gets
/// `/v1/responses` appended.
pub fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_ENDPOINT.to_string();
    }
    if trimmed.ends_with("/responses") {
        return trimmed.to_string();
    }
    if trimmed.ends_with("/v1") {
        return format!("{}/responses", trimmed);
    }
    if trimmed.contains("/v1/") {
        return trimmed.to_string();
    }
    format!("{}/v1/responses", trimmed)
}

/// Exponential backoff capped at 4 seconds: `min(500 * 2^attempt, 4000)` ms.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = 500u64.saturating_mul(1u64 << attempt.min(16)).min(4_000);
    Duration::from_millis(ms)
}

/// Read a response body, failing hard once it exceeds [`MAX_RESPONSE_BYTES`].
pub async fn read_bounded_body(mut response: reqwest::Response) -> Result<Vec<u8>, LlmError> {
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| LlmError::Transport(e.to_string()))?
    {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(LlmError::OversizeBody {
                limit: MAX_RESPONSE_BYTES,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_base_url_uses_default_endpoint() {
        assert_eq!(normalize_endpoint(""), DEFAULT_ENDPOINT);
        assert_eq!(normalize_endpoint("   "), DEFAULT_ENDPOINT);
    }

    #[test]
    fn responses_suffix_is_preserved() {
        assert_eq!(
            normalize_endpoint("https://proxy.local/v1/responses"),
            "https://proxy.local/v1/responses"
        );
        assert_eq!(
            normalize_endpoint("https://proxy.local/v1/responses/"),
            "https://proxy.local/v1/responses"
        );
    }

    #[test]
    fn v1_suffix_gets_responses_appended() {
        assert_eq!(
            normalize_endpoint("https://api.openai.com/v1"),
            "https://api.openai.com/v1/responses"
        );
    }

    #[test]
    fn paths_containing_v1_are_used_as_is() {
        assert_eq!(
            normalize_endpoint("https://gw.local/v1/custom"),
            "https://gw.local/v1/custom"
        );
    }

    #[test]
    fn bare_hosts_get_the_full_path() {
        assert_eq!(
            normalize_endpoint("https://llm.internal"),
            "https://llm.internal/v1/responses"
        );
    }

    #[test]
    fn backoff_doubles_and_caps_at_four_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(10), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(63), Duration::from_millis(4_000));
    }
}
