//! Retry executor: bounded retries with exponential backoff, optionally
//! guarded by a [`CircuitBreaker`].

use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::warn;

use super::backoff::backoff_delay;
use super::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::error::EngineError;

/// Message fragments that mark an error as permanent when no allow-list is
/// configured.
const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "validation",
    "invalid",
    "unauthorized",
    "forbidden",
    "not found",
    "not-found",
];

/// Result of an executed operation plus retry bookkeeping.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, EngineError>,
    /// Invocations of the operation. Zero when the circuit rejected the call
    /// up front.
    pub attempts: u32,
    /// Sum of the backoff sleeps between attempts.
    pub total_delay: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Discards the bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub fn into_result(self) -> Result<T, EngineError> {
        self.result
    }
}

pub struct RetryExecutor {
    config: RetryConfig,
    breaker: Option<CircuitBreaker>,
}

impl RetryExecutor {
    /// Creates an executor; the breaker is only built when `circuit.enabled`.
    #[must_use]
    pub fn new(config: RetryConfig, circuit: &CircuitBreakerConfig) -> Self {
        let breaker = circuit.enabled.then(|| CircuitBreaker::new(circuit.clone()));
        Self { config, breaker }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Whether a failure should be attempted again.
    ///
    /// Terminal kinds never are. With `retryable_errors` configured, only
    /// errors whose kind name or message contains an entry are retried;
    /// otherwise everything except well-known permanent failures is.
    #[must_use]
    pub fn is_retryable(&self, err: &EngineError) -> bool {
        let kind = err.kind();
        if kind.is_terminal() {
            return false;
        }
        let message = err.to_string().to_lowercase();
        match &self.config.retryable_errors {
            Some(allowed) => allowed.iter().any(|entry| {
                let entry = entry.to_lowercase();
                entry == kind.as_str() || message.contains(&entry)
            }),
            None => !NON_RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)),
        }
    }

    /// Runs `operation` until it succeeds, fails permanently, or
    /// `max_retries + 1` attempts have been made.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            if let Some(breaker) = &self.breaker {
                if let Err(wait) = breaker.try_acquire() {
                    let retry_after_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
                    return RetryOutcome {
                        result: Err(EngineError::CircuitOpen { retry_after_ms }),
                        attempts,
                        total_delay,
                    };
                }
            }

            attempts += 1;
            metrics::counter!("flatshard_retry_attempts_total").increment(1);

            let err: EngineError = match operation().await {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        total_delay,
                    };
                }
                Err(err) => err.into(),
            };

            if let Some(breaker) = &self.breaker {
                breaker.record_failure();
            }
            if attempts >= max_attempts || !self.is_retryable(&err) {
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                    total_delay,
                };
            }

            // A tripped breaker rejects the next attempt; skip the backoff.
            if self.breaker.as_ref().is_some_and(|b| b.state() == CircuitState::Open) {
                continue;
            }

            let delay = backoff_delay(&self.config, attempts);
            warn!(
                attempt = attempts,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
            total_delay += delay;
        }
    }

    /// Like [`execute`](Self::execute), but every attempt races `timeout`.
    ///
    /// An attempt that loses the race is dropped and counts as an
    /// [`EngineError::Timeout`] failure naming `name`.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.execute(|| {
            let attempt = operation();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result.map_err(Into::into),
                    Err(_elapsed) => Err(EngineError::Timeout {
                        operation: name.to_string(),
                        timeout_ms,
                    }),
                }
            }
        })
        .await
    }

    /// Runs the operations one after another. With `fail_fast`, stops after
    /// the first failed outcome (which is included).
    pub async fn execute_all<T, E, F, Fut>(
        &self,
        operations: impl IntoIterator<Item = F>,
        fail_fast: bool,
    ) -> Vec<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        let mut outcomes = Vec::new();
        for operation in operations {
            let outcome = self.execute(operation).await;
            let failed = !outcome.is_success();
            outcomes.push(outcome);
            if failed && fail_fast {
                break;
            }
        }
        outcomes
    }

    /// Runs the operations concurrently; outcomes are in input order.
    pub async fn execute_all_parallel<T, E, F, Fut>(
        &self,
        operations: impl IntoIterator<Item = F>,
    ) -> Vec<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        join_all(operations.into_iter().map(|operation| self.execute(operation))).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::{ErrorKind, StorageError};
    use crate::resilience::CircuitState;

    fn retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retryable_errors: None,
        }
    }

    fn executor(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(retry(max_retries), &CircuitBreakerConfig::default())
    }

    fn flaky() -> EngineError {
        EngineError::storage(anyhow::anyhow!("connection reset"))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures() {
        let calls = AtomicU32::new(0);
        let outcome = executor(3)
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(flaky())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), "done");
        // 100ms + 200ms plus at most 10% jitter each.
        assert!(outcome.total_delay >= Duration::from_millis(300));
        assert!(outcome.total_delay <= Duration::from_millis(330));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries_plus_one() {
        let outcome: RetryOutcome<()> = executor(3).execute(|| async { Err(flaky()) }).await;
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Io);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_abort_immediately() {
        let exec = executor(5);

        let outcome: RetryOutcome<()> = exec
            .execute(|| async { Err(EngineError::Validation("bad input".into())) })
            .await;
        assert_eq!(outcome.attempts, 1);

        let outcome: RetryOutcome<()> = exec
            .execute(|| async { Err(EngineError::Internal(anyhow::anyhow!("Unauthorized access"))) })
            .await;
        assert_eq!(outcome.attempts, 1);

        let outcome: RetryOutcome<()> = exec
            .execute(|| async {
                Err(EngineError::storage(
                    StorageError::NotFound {
                        location: "gone.json".into(),
                    }
                    .into(),
                ))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.total_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn allow_list_restricts_retries() {
        let config = RetryConfig {
            retryable_errors: Some(vec!["ECONNRESET".into(), "timeout".into()]),
            ..retry(2)
        };
        let exec = RetryExecutor::new(config, &CircuitBreakerConfig::default());

        let outcome: RetryOutcome<()> = exec
            .execute(|| async { Err(EngineError::Internal(anyhow::anyhow!("read ECONNRESET"))) })
            .await;
        assert_eq!(outcome.attempts, 3);

        let outcome: RetryOutcome<()> = exec
            .execute(|| async { Err(EngineError::Internal(anyhow::anyhow!("disk full"))) })
            .await;
        assert_eq!(outcome.attempts, 1);

        let timeout = EngineError::Timeout {
            operation: "x".into(),
            timeout_ms: 1,
        };
        assert!(exec.is_retryable(&timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_invoking() {
        let circuit = CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(5),
            half_open_max_attempts: 1,
        };
        let exec = RetryExecutor::new(retry(0), &circuit);
        let calls = AtomicU32::new(0);
        let failing = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(flaky()) }
        };

        exec.execute(failing).await;
        exec.execute(failing).await;
        assert_eq!(exec.breaker().unwrap().state(), CircuitState::Open);

        let rejected = exec.execute(failing).await;
        assert_eq!(rejected.attempts, 0);
        assert_eq!(rejected.result.unwrap_err().kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = exec.execute(|| async { Ok::<_, EngineError>(7) }).await;
        assert_eq!(trial.result.unwrap(), 7);
        assert_eq!(exec.breaker().unwrap().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn tripping_the_circuit_skips_remaining_backoff() {
        let circuit = CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(5),
            half_open_max_attempts: 1,
        };
        let exec = RetryExecutor::new(retry(5), &circuit);
        let calls = AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let outcome: RetryOutcome<()> = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(flaky()) }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::CircuitOpen);
        // Only the backoff after the first failure was slept.
        assert!(outcome.total_delay >= Duration::from_millis(100));
        assert!(outcome.total_delay <= Duration::from_millis(110));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempt_is_cancelled() {
        let finished = Arc::new(AtomicBool::new(false));
        let outcome: RetryOutcome<()> = executor(0)
            .execute_with_timeout("slow read", Duration::from_millis(50), || {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok::<_, EngineError>(())
                }
            })
            .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.to_string(), "operation 'slow read' timed out after 50ms");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried() {
        let calls = AtomicU32::new(0);
        let outcome = executor(2)
            .execute_with_timeout("warmup", Duration::from_millis(10), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok::<_, EngineError>(n)
                }
            })
            .await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_all_fail_fast_stops_early() {
        let exec = executor(0);
        let ops = (0..4).map(|i| move || async move {
            if i == 1 {
                Err(flaky())
            } else {
                Ok(i)
            }
        });
        let outcomes = exec.execute_all(ops.clone(), true).await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[1].is_success());

        let outcomes = exec.execute_all(ops, false).await;
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes.into_iter().filter(RetryOutcome::is_success).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_outcomes_keep_input_order() {
        let exec = executor(0);
        let ops = [30u64, 10, 20].into_iter().map(|ms| move || async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, EngineError>(ms)
        });
        let values: Vec<u64> = exec
            .execute_all_parallel(ops)
            .await
            .into_iter()
            .map(|o| o.into_result().unwrap())
            .collect();
        assert_eq!(values, vec![30, 10, 20]);
    }
}
