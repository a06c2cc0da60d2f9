//! Three-state circuit breaker.
//!
//! `Closed` counts consecutive failures and trips to `Open` at the threshold.
//! `Open` rejects calls until `reset_timeout` has passed since the last
//! failure, then admits probes in `HalfOpen`. A successful probe closes the
//! circuit; `half_open_max_attempts` failed probes re-open it.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_attempts: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_attempts: u32,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            half_open_attempts: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        if self.state != to {
            debug!(from = ?self.state, to = ?to, "circuit breaker transition");
            self.state = to;
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    /// Asks permission to invoke the protected operation.
    ///
    /// # Errors
    ///
    /// Returns the remaining wait when the circuit is open.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }
        let since_failure = state
            .last_failure
            .map_or(self.config.reset_timeout, |at| Instant::now().saturating_duration_since(at));
        if since_failure >= self.config.reset_timeout {
            state.half_open_attempts = 0;
            state.transition(CircuitState::HalfOpen);
            Ok(())
        } else {
            metrics::counter!("flatshard_circuit_rejections_total").increment(1);
            Err(self.config.reset_timeout - since_failure)
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.half_open_attempts = 0;
        state.transition(CircuitState::Closed);
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.last_failure = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_attempts += 1;
                if state.half_open_attempts >= self.config.half_open_max_attempts {
                    state.transition(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_attempts: state.half_open_attempts,
        }
    }

    /// Forces the breaker back to `Closed` with cleared counters.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::closed();
    }
}
