use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use echelon_core::errors::InvokeError;
use echelon_core::provider::{Decision, DecisionProvider, DecisionRequest};

/// Configuration for retry and per-call timeout behavior.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Upper bound on a single upstream call, including response read.
    pub call_timeout: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Wraps a DecisionProvider with a per-call timeout and bounded retries.
///
/// - Retryable errors (unavailable, timeout) back off exponentially with jitter
/// - Fatal errors (rejected requests) return immediately
pub struct ReliableProvider<P: DecisionProvider> {
    inner: P,
    config: ReliableConfig,
    total_retries: AtomicU64,
}

impl<P: DecisionProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    /// Calculate delay for a retry attempt using exponential backoff + jitter.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(100.0);

        Duration::from_millis(final_ms as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    async fn call_once(&self, request: &DecisionRequest) -> Result<Decision, InvokeError> {
        match tokio::time::timeout(self.config.call_timeout, self.inner.decide(request)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout(self.config.call_timeout)),
        }
    }
}

#[async_trait]
impl<P: DecisionProvider> DecisionProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, InvokeError> {
        let mut last_error: Option<InvokeError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.call_once(request).await {
                Ok(decision) => return Ok(decision),
                Err(e) => {
                    if !e.is_retryable() || attempt == self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt);
                    self.total_retries.fetch_add(1, Ordering::Relaxed);

                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying upstream call"
                    );

                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or(InvokeError::UpstreamUnavailable {
            detail: "max retries exceeded".into(),
        }))
    }
}
