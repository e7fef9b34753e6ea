/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Reconnection policies.
//!
//! A policy maps the 1-based attempt number to the delay before that attempt,
//! or `None` once attempts are exhausted. The session moves to a terminal
//! error when the policy gives up.

use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;

pub trait ReconnectionPolicy: Send + Sync + Debug {
    fn max_attempts(&self) -> u32;

    /// Delay before attempt `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// `base + step * (attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearBackoff {
    pub base: Duration,
    pub step: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectionPolicy for LinearBackoff {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let grown = self.base.saturating_add(self.step.saturating_mul(attempt - 1));
        Some(grown.min(self.max_delay))
    }
}

/// `initial * factor^(attempt - 1)`, capped at `max_delay`, with up to
/// `jitter` (a fraction in `0.0..=1.0`) shaved off at random so that peers
/// dropped together do not reconnect in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(15),
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl ReconnectionPolicy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.initial.as_secs_f64() * self.factor.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let scaled = if jitter > 0.0 {
            capped * (1.0 - rand::thread_rng().gen_range(0.0..=jitter))
        } else {
            capped
        };
        Some(Duration::from_secs_f64(scaled.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_grows_by_step_and_caps() {
        let policy = LinearBackoff {
            base: Duration::from_millis(500),
            step: Duration::from_millis(250),
            max_delay: Duration::from_millis(1_000),
            max_attempts: 4,
        };
        assert_eq!(policy.delay(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(750)));
        assert_eq!(policy.delay(3), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay(4), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay(5), None);
    }

    #[test]
    fn attempt_zero_is_never_scheduled() {
        assert_eq!(ExponentialBackoff::default().delay(0), None);
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let policy = ExponentialBackoff::default();
        let delays: Vec<u128> = (1..=5)
            .filter_map(|i| policy.delay(i))
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 15_000]);
        assert_eq!(policy.delay(6), None);
    }

    #[test]
    fn jitter_only_shortens() {
        let policy = ExponentialBackoff {
            jitter: 0.5,
            ..ExponentialBackoff::default()
        };
        for _ in 0..100 {
            let d = policy.delay(3).unwrap();
            assert!(d <= Duration::from_secs(4));
            assert!(d >= Duration::from_secs(2));
        }
    }
}
