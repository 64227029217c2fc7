//! Retry policy for upstream forwarding
//!
//! Exponential backoff (x2 per attempt) with +/-20% jitter. Transport
//! errors and 408/429/5xx responses are retryable; anything else fails fast.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::warn;

use crate::{Error, Result};

/// Retry policy for forwarded payloads
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff_seconds: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::from_secs_f64(base_backoff_seconds.max(0.2)),
        }
    }

    /// Delay before the given retry (1-based attempt that just failed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.base_backoff.as_secs_f64() * f64::from(1u32 << exponent);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(base * jitter)
    }

    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429) || status.is_server_error()
    }
}

/// POST a JSON payload with the policy applied. The optional token is sent
/// as `X-Cloud-Token`, matching the ingest API's auth contract.
pub async fn post_json_with_retries(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    payload: &Value,
    policy: &RetryPolicy,
) -> Result<()> {
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        let mut request = client.post(url).json(payload);
        if let Some(token) = token.filter(|token| !token.is_empty()) {
            request = request.header("X-Cloud-Token", token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                last_error = format!("status={status} body={}", snippet(&body));
                if !RetryPolicy::is_retryable_status(status) || attempt >= policy.max_attempts {
                    return Err(Error::Upstream(format!("POST {url}: {last_error}")));
                }
                warn!(
                    url = %url,
                    status = %status,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "forward retry after status"
                );
            }
            Err(err) => {
                last_error = err.to_string();
                if attempt >= policy.max_attempts {
                    return Err(Error::Upstream(format!("POST {url}: {last_error}")));
                }
                warn!(
                    url = %url,
                    error = %err,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "forward retry after network error"
                );
            }
        }

        tokio::time::sleep(policy.delay(attempt)).await;
    }

    Err(Error::Upstream(format!("POST {url}: {last_error}")))
}

fn snippet(text: &str) -> String {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= 240 {
        compact
    } else {
        let head: String = compact.chars().take(237).collect();
        format!("{head}...")
    }
}
