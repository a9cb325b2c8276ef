use std::future::Future;

use async_trait::async_trait;
use mnemos_common::{MnemosError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::{LlmClient, LlmRequest, LlmResponse};
use crate::embedding::EmbeddingClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * jitter_fraction(attempt)) as u64;
        (base as u64).saturating_add(jitter).min(self.max_delay_ms)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// retries run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_retries || !is_transient(&e) {
                        return Err(e);
                    }

                    let error_msg = e.to_string();
                    let delay = parse_retry_after(&error_msg)
                        .map(|ms| ms.min(self.max_delay_ms))
                        .unwrap_or_else(|| self.delay_for(attempt));

                    warn!(
                        call = label,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay,
                        error = %error_msg,
                        "Retrying provider request"
                    );

                    tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Rate limits and 5xx responses are worth retrying; auth failures and bad
/// requests are not.
fn is_transient(error: &MnemosError) -> bool {
    if !error.is_backend_failure() {
        return false;
    }
    let lower = error.to_string().to_lowercase();
    ["429", "rate limit", "500", "502", "503", "504", "server error", "bad gateway", "service unavailable", "gateway timeout"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn parse_retry_after(error_msg: &str) -> Option<u64> {
    let lower = error_msg.to_lowercase();
    let pos = lower.find("retry-after")?;
    error_msg[pos..].split_whitespace().skip(1).find_map(|word| {
        word.trim_end_matches(|c: char| !c.is_ascii_digit())
            .parse::<u64>()
            .ok()
            .map(|secs| secs * 1000)
    })
}

/// Deterministic spread in [0, 1) so concurrent callers do not retry in lockstep.
fn jitter_fraction(attempt: u32) -> f64 {
    let x = attempt.wrapping_add(1).wrapping_mul(2_654_435_761);
    (x % 100) as f64 / 100.0
}

/// Wraps a completion or embedding client with [`RetryConfig::run`].
pub struct RetryingClient<T> {
    inner: T,
    config: RetryConfig,
}

impl<T> RetryingClient<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<T: LlmClient> LlmClient for RetryingClient<T> {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.config
            .run("completion", || self.inner.complete(request.clone()))
            .await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[async_trait]
impl<T: EmbeddingClient> EmbeddingClient for RetryingClient<T> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.config.run("embedding", || self.inner.embed(text)).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.config
            .run("embedding_batch", || self.inner.embed_batch(texts))
            .await
    }

    async fn warmup(&self) -> Result<()> {
        self.inner.warmup().await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn transient_error_detection() {
        assert!(is_transient(&MnemosError::BackendUnavailable(
            "API error 429 Too Many Requests: rate limit exceeded".into()
        )));
        assert!(is_transient(&MnemosError::EmbeddingUnavailable(
            "embedding API error 503 Service Unavailable".into()
        )));
        assert!(!is_transient(&MnemosError::BackendUnavailable(
            "API error 401 Unauthorized".into()
        )));
        assert!(!is_transient(&MnemosError::validation("status 500 in content")));
    }

    #[test]
    fn parse_retry_after_from_error() {
        assert_eq!(parse_retry_after("429 Too Many Requests, Retry-After: 5"), Some(5000));
        assert_eq!(parse_retry_after("429 Too Many Requests"), None);
    }

    #[test]
    fn delay_grows_and_respects_max() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_multiplier: 10.0,
        };
        assert!(config.delay_for(0) >= 100);
        assert!(config.delay_for(1) >= 1000);
        assert_eq!(config.delay_for(5), 2000);
    }

    #[tokio::test]
    async fn run_retries_transient_failures_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast()
            .run("test", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(MnemosError::BackendUnavailable("503 Service Unavailable".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_immediately_on_permanent_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast()
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MnemosError::BackendUnavailable("401 Unauthorized".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_stops_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast()
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MnemosError::BackendUnavailable("502 bad gateway".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
