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

//! Per-session diagnostics stream.
//!
//! Each session owns its own bounded flume channel; nothing is global, so two
//! sessions in one process never see each other's metrics. When nobody is
//! draining the stream it keeps the most recent readings.

use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

const DIAG_CAPACITY: usize = 512;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagEvent {
    /// Sub-system that produced this event (e.g. "session", "tier", "heartbeat").
    pub subsystem: &'static str,
    /// Participant name, once known.
    pub stream_id: Option<String>,
    /// Unix time in milliseconds when the metric was captured.
    pub ts_ms: u64,
    pub metrics: Vec<Metric>,
}

impl DiagEvent {
    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.iter().find(|m| m.name == name).map(|m| &m.value)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metric {
    pub name: &'static str,
    pub value: MetricValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum MetricValue {
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
}

/// Shorthand for constructing a [`Metric`].
#[macro_export]
macro_rules! metric {
    ($name:expr, $value:expr) => {
        $crate::diagnostics::Metric {
            name: $name,
            value: $crate::diagnostics::MetricValue::from($value),
        }
    };
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::I64(v)
    }
}
impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::U64(v)
    }
}
impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::U64(v as u64)
    }
}
impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::F64(v)
    }
}
impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}
impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug)]
pub struct DiagnosticsReporter {
    tx: Sender<DiagEvent>,
    rx: Receiver<DiagEvent>,
    stream_id: Option<String>,
}

impl Default for DiagnosticsReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsReporter {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(DIAG_CAPACITY);
        Self {
            tx,
            rx,
            stream_id: None,
        }
    }

    pub fn set_stream_id(&mut self, stream_id: &str) {
        self.stream_id = Some(stream_id.to_string());
    }

    pub fn report(&self, subsystem: &'static str, metrics: Vec<Metric>) {
        let event = DiagEvent {
            subsystem,
            stream_id: self.stream_id.clone(),
            ts_ms: now_ms(),
            metrics,
        };
        let Err(TrySendError::Full(event)) = self.tx.try_send(event) else {
            return;
        };
        // Evict the oldest reading to make room.
        let _ = self.rx.try_recv();
        if self.tx.try_send(event).is_err() {
            log::trace!("diagnostics stream full, dropping {subsystem} event");
        }
    }

    /// Receiver for this session's events. Receivers compete for events, so
    /// hand this to a single consumer.
    pub fn subscribe(&self) -> Receiver<DiagEvent> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_events_carry_stream_id() {
        let mut reporter = DiagnosticsReporter::new();
        reporter.set_stream_id("alice");
        let rx = reporter.subscribe();
        reporter.report("tier", vec![metric!("tier", "native"), metric!("elapsed_ms", 42u64)]);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.subsystem, "tier");
        assert_eq!(event.stream_id.as_deref(), Some("alice"));
        assert_eq!(event.metric("elapsed_ms"), Some(&MetricValue::U64(42)));
    }

    #[test]
    fn full_stream_keeps_the_newest_readings() {
        let reporter = DiagnosticsReporter::new();
        for seq in 0..(DIAG_CAPACITY as u64 + 10) {
            reporter.report("session", vec![metric!("seq", seq)]);
        }
        let rx = reporter.subscribe();
        assert_eq!(rx.len(), DIAG_CAPACITY);
        let oldest = rx.try_recv().unwrap();
        assert_eq!(oldest.metric("seq"), Some(&MetricValue::U64(10)));
        let newest = rx.drain().last().unwrap();
        assert_eq!(
            newest.metric("seq"),
            Some(&MetricValue::U64(DIAG_CAPACITY as u64 + 9))
        );
    }
}
