pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Wraps upstream-bound operations with a per-call deadline, classified
/// retry with backoff, and a per-upstream circuit breaker.
pub struct Resilience {
    registry: BreakerRegistry,
    breaker_enabled: bool,
}

impl Resilience {
    pub fn new(config: BreakerConfig, breaker_enabled: bool) -> Self {
        Self {
            registry: BreakerRegistry::new(config),
            breaker_enabled,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                cool_down: config.breaker_cool_down(),
            },
            config.circuit_breaker_enabled,
        )
    }

    /// The breaker guarding an upstream identity (created on first use).
    pub fn breaker(&self, operation_id: &str) -> Arc<CircuitBreaker> {
        self.registry.breaker(operation_id)
    }

    /// Run `op` under the policy. Transient failures are retried with
    /// exponential backoff and jitter and counted by the breaker; permanent
    /// and not-found outcomes propagate immediately without touching the
    /// failure count. An Open breaker short-circuits before any attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = if self.breaker_enabled {
            Some(self.registry.breaker(operation_id))
        } else {
            None
        };

        let mut last_err: Option<Error> = None;
        let mut attempts_made: u32 = 0;

        for attempt in 0..policy.max_attempts {
            if let Some(breaker) = &breaker {
                if let Err(open) = breaker.try_acquire() {
                    // Opened mid-loop: surface the real upstream error
                    // rather than the synthetic one
                    return Err(match last_err.take() {
                        Some(last) if attempts_made > 0 => Error::RetriesExhausted {
                            attempts: attempts_made,
                            last: Box::new(last),
                        },
                        _ => open,
                    });
                }
            }

            attempts_made = attempt + 1;
            let result = match timeout(policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "{} exceeded {}ms deadline",
                    operation_id,
                    policy.timeout.as_millis()
                ))),
            };

            match result {
                Ok(value) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(err) if err.is_not_found() || err.is_permanent() => {
                    // The upstream responded; this is a caller outcome,
                    // not a health signal
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    return Err(err);
                }
                Err(err) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }

                    let retryable = policy.should_retry(&err);
                    debug!(
                        operation = operation_id,
                        attempt = attempts_made,
                        error = %err,
                        retryable,
                        "upstream call failed"
                    );
                    last_err = Some(err);

                    if !retryable || attempts_made == policy.max_attempts {
                        break;
                    }

                    tokio::time::sleep(policy.jittered_delay(attempt)).await;
                }
            }
        }

        let last = last_err.unwrap_or_else(|| {
            Error::Http(format!("{} failed without recording an error", operation_id))
        });
        Err(Error::RetriesExhausted {
            attempts: attempts_made,
            last: Box::new(last),
        })
    }
}

/// Run `primary`; on failure, report through `on_error` and produce a
/// degraded-but-successful result from `fallback`. The fallback is not
/// itself retried.
pub async fn with_fallback<T, P, FB, FbFut, O>(primary: P, fallback: FB, on_error: O) -> Result<T>
where
    P: Future<Output = Result<T>>,
    FB: FnOnce() -> FbFut,
    FbFut: Future<Output = Result<T>>,
    O: FnOnce(&Error),
{
    match primary.await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(error = %err, "primary operation failed, falling back");
            on_error(&err);
            fallback().await
        }
    }
}
