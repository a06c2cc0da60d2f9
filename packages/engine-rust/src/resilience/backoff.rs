//! Exponential backoff with additive jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Fraction of the computed delay used as the upper bound of the jitter.
const JITTER_RATIO: f64 = 0.1;

/// Delay before the retry that follows failed attempt `attempt` (1-based),
/// without jitter: `base * multiplier^(attempt - 1)`, capped at `max_delay`.
#[must_use]
pub fn base_delay_for(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let factor = sanitize_multiplier(config.backoff_multiplier).powi(exponent);
    scaled(config.base_delay, factor).min(config.max_delay)
}

/// Delay before the retry that follows failed attempt `attempt` (1-based):
/// `min(base * multiplier^(attempt - 1) + jitter, max_delay)` with jitter
/// drawn uniformly from `[0, 0.1 * delay]`.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = base_delay_for(config, attempt);
    let jitter_cap = delay.as_secs_f64() * JITTER_RATIO;
    let jitter = if jitter_cap > 0.0 {
        rand::rng().random_range(0.0..=jitter_cap)
    } else {
        0.0
    };
    (delay + Duration::from_secs_f64(jitter)).min(config.max_delay)
}

fn sanitize_multiplier(multiplier: f64) -> f64 {
    if multiplier.is_finite() && multiplier >= 0.0 {
        multiplier
    } else {
        1.0
    }
}

fn scaled(base: Duration, factor: f64) -> Duration {
    let secs = base.as_secs_f64() * factor;
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    }
}
