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

//! Deadlines owned by the session loop.
//!
//! The loop sleeps until the nearest deadline, so arming and cancelling are
//! plain map operations and a cancelled timer can never fire late.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    JoinFallback,
    TierTimeout,
    Reconnect,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    deadlines: HashMap<TimerKind, Instant>,
}

impl Timers {
    /// Arm or re-arm `kind`.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.deadlines.insert(kind, Instant::now() + after);
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    #[cfg(test)]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn next_deadline(&self) -> Option<(TimerKind, Instant)> {
        self.deadlines
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(kind, at)| (*kind, *at))
    }
}

/// Resolves when the given deadline passes; never, without one.
pub(crate) async fn fire(deadline: Option<(TimerKind, Instant)>) -> TimerKind {
    match deadline {
        Some((kind, at)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn nearest_deadline_fires_first() {
        let mut timers = Timers::default();
        timers.arm(TimerKind::Reconnect, Duration::from_secs(5));
        timers.arm(TimerKind::TierTimeout, Duration::from_secs(2));
        assert_eq!(timers.len(), 2);
        assert_eq!(fire(timers.next_deadline()).await, TimerKind::TierTimeout);
    }

    #[test]
    fn cancel_and_clear() {
        let mut timers = Timers::default();
        timers.arm(TimerKind::JoinFallback, Duration::from_secs(1));
        assert!(timers.is_armed(TimerKind::JoinFallback));
        assert!(timers.cancel(TimerKind::JoinFallback));
        assert!(!timers.cancel(TimerKind::JoinFallback));
        timers.arm(TimerKind::Reconnect, Duration::from_secs(1));
        timers.clear();
        assert_eq!(timers.len(), 0);
        assert!(timers.next_deadline().is_none());
    }
}
