//! Retry engine
//!
//! Exponential backoff with jitter around an async operation. Retries only
//! errors the taxonomy marks retryable; backoff sleeps race against the
//! request context so cancellation wins immediately.

use std::future::Future;
use std::time::Duration;

use rand::{rngs::OsRng, RngCore};

use crate::config::Settings;
use crate::gateway::context::RequestContext;
use crate::gateway::error::GatewayError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt, so `3` means up to 4 attempts.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Uniform noise added on top of the deterministic delay, as a
    /// fraction of it.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_factor: settings.backoff_factor,
            jitter: settings.jitter,
        }
    }
}

/// Delay before the retry following `attempt` (0-based), jitter included.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config.initial_backoff.as_millis() as f64;
    let factor = config.backoff_factor.max(1.0);
    let deterministic = (base * factor.powi(attempt.min(16) as i32))
        .min(config.max_backoff.as_millis() as f64) as u64;

    let jitter_span = (deterministic as f64 * config.jitter.max(0.0)) as u64;
    let jitter = if jitter_span == 0 {
        0
    } else {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes) % (jitter_span + 1)
    };

    Duration::from_millis(deterministic + jitter)
}

/// Outcome of a retried operation, with the number of retries performed.
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: Result<T, GatewayError>,
    pub retries: u32,
}

/// Invoke `f` until it succeeds, a non-retryable error short-circuits, the
/// retry budget runs out, or the context is cancelled.
///
/// The closure owns its inputs (clone into an `async move` block) so each
/// attempt gets a fresh future.
pub async fn run<T, F, Fut>(ctx: &RequestContext, config: &RetryConfig, mut f: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut retries = 0u32;
    loop {
        if ctx.is_cancelled() {
            return Attempted {
                outcome: Err(ctx.cancellation_error()),
                retries,
            };
        }

        match f().await {
            Ok(value) => {
                return Attempted {
                    outcome: Ok(value),
                    retries,
                }
            }
            Err(err) => {
                if !err.retryable() || retries >= config.max_retries {
                    return Attempted {
                        outcome: Err(err),
                        retries,
                    };
                }

                let delay = backoff_delay(retries, config);
                tokio::select! {
                    _ = ctx.cancelled() => {
                        return Attempted {
                            outcome: Err(ctx.cancellation_error()),
                            retries,
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                retries += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ModelType;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }

    fn retryable_error() -> GatewayError {
        GatewayError::Unavailable {
            provider: Some(ModelType::OpenAi),
            detail: "upstream returned 503".into(),
        }
    }

    #[tokio::test]
    async fn stops_at_retry_budget() {
        let ctx = RequestContext::new(None, None, None);
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);

        let attempted = run(&ctx, &fast_config(), move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(retryable_error())
            }
        })
        .await;

        assert!(attempted.outcome.is_err());
        assert_eq!(attempted.retries, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_invokes_exactly_once() {
        let ctx = RequestContext::new(None, None, None);
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);

        let attempted = run(&ctx, &fast_config(), move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GatewayError::InvalidRequest("bad".into()))
            }
        })
        .await;

        assert_eq!(attempted.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_returns_immediately() {
        let ctx = RequestContext::new(None, None, None);
        let attempted = run(&ctx, &fast_config(), || async { Ok::<_, GatewayError>(7) }).await;
        assert_eq!(attempted.outcome.unwrap(), 7);
        assert_eq!(attempted.retries, 0);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let ctx = RequestContext::new(None, None, None);
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);

        let attempted = run(&ctx, &fast_config(), move || {
            let counted = Arc::clone(&counted);
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(retryable_error())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(attempted.outcome.unwrap(), "ok");
        assert_eq!(attempted.retries, 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(30),
            ..fast_config()
        };
        let ctx = RequestContext::new(None, None, None);
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let attempted = run(&ctx, &config, || async {
            Err::<(), _>(retryable_error())
        })
        .await;

        assert!(attempted.outcome.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            attempted.outcome.unwrap_err(),
            GatewayError::Cancelled
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig::default();
        let d0 = backoff_delay(0, &config);
        let d1 = backoff_delay(1, &config);
        assert!(d0.as_millis() >= 1000);
        assert!(d1.as_millis() >= 2000);

        let capped = backoff_delay(16, &config);
        let ceiling = config.max_backoff.as_millis() as f64 * (1.0 + config.jitter) + 1.0;
        assert!((capped.as_millis() as f64) <= ceiling);
    }
}
