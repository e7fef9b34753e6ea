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

//! Keep-alive pulses while a participant is joined but not yet sending media.
//!
//! The monitor only sends and counts. A missing [`HeartbeatAck`] is logged and
//! reported, never acted on; link loss is detected by the link itself.
//!
//! [`HeartbeatAck`]: videocall_signaling::Payload::HeartbeatAck

use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use videocall_signaling::{Callback, SignalingMessage};
use videocall_transport::SignalingLink;

struct Target {
    link: Arc<dyn SignalingLink>,
    room_id: String,
}

struct Running {
    // Emptied by `stop` before the task is aborted; the task sends only while
    // holding this lock, so no pulse can leave after `stop` returns.
    target: Arc<Mutex<Option<Target>>>,
    acks: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

pub struct HeartbeatMonitor {
    ack_grace: u64,
    on_missed: Callback<u64>,
    running: Option<Running>,
}

impl HeartbeatMonitor {
    /// `ack_grace` is how many pulses may be outstanding before `on_missed`
    /// fires with the outstanding count.
    pub fn new(ack_grace: u32, on_missed: Callback<u64>) -> Self {
        Self {
            ack_grace: ack_grace as u64,
            on_missed,
            running: None,
        }
    }

    /// Start pulsing on `link`. Replaces any previous run. The first pulse
    /// goes out one `interval` after the call.
    pub fn start(&mut self, link: Arc<dyn SignalingLink>, room_id: &str, interval: Duration) {
        self.stop();
        let target = Arc::new(Mutex::new(Some(Target {
            link,
            room_id: room_id.to_string(),
        })));
        let acks = Arc::new(AtomicU64::new(0));
        let sent = Arc::new(AtomicU64::new(0));

        let task = {
            let target = target.clone();
            let acks = acks.clone();
            let sent = sent.clone();
            let ack_grace = self.ack_grace;
            let on_missed = self.on_missed.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let guard = lock(&target);
                    let Some(target) = guard.as_ref() else {
                        break;
                    };
                    match target.link.send(SignalingMessage::heartbeat(&target.room_id)) {
                        Ok(()) => debug!("heartbeat sent for room {}", target.room_id),
                        Err(e) => warn!("heartbeat send failed: {e}"),
                    }
                    let sent_total = sent.fetch_add(1, Ordering::AcqRel) + 1;
                    let outstanding = sent_total.saturating_sub(acks.load(Ordering::Acquire));
                    if outstanding > ack_grace {
                        warn!(
                            "{outstanding} heartbeats without ack in room {}",
                            target.room_id
                        );
                        on_missed.emit(outstanding);
                    }
                }
            })
        };

        self.running = Some(Running {
            target,
            acks,
            sent,
            task,
        });
    }

    /// Synchronous: once this returns no further heartbeat is sent.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            lock(&running.target).take();
            running.task.abort();
        }
    }

    pub fn note_ack(&self) {
        if let Some(running) = &self.running {
            running.acks.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    pub fn sent(&self) -> u64 {
        self.running
            .as_ref()
            .map(|r| r.sent.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use videocall_signaling::MessageType;
    use videocall_transport::LinkFactory;
    use videocall_transport::LoopbackHub;

    async fn joined_link(hub: &LoopbackHub, name: &str) -> Arc<dyn SignalingLink> {
        let link = hub.create();
        link.connect(&[hub.url()]).await.unwrap();
        link.send(SignalingMessage::join("room", name)).unwrap();
        link
    }

    #[tokio::test(start_paused = true)]
    async fn pulses_every_interval_until_stopped() {
        let hub = LoopbackHub::new();
        let link = joined_link(&hub, "alice").await;
        let mut monitor = HeartbeatMonitor::new(3, Callback::noop());

        monitor.start(link.clone(), "room", Duration::from_secs(1));
        assert!(monitor.is_active());
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(hub.count_from("alice", MessageType::Heartbeat), 3);

        monitor.stop();
        assert!(!monitor.is_active());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hub.count_from("alice", MessageType::Heartbeat), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_acks_are_reported_not_acted_on() {
        let hub = LoopbackHub::new();
        hub.set_heartbeat_acks(false);
        let link = joined_link(&hub, "bob").await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut monitor = HeartbeatMonitor::new(
            1,
            Callback::from(move |outstanding| {
                let _ = tx.send(outstanding);
            }),
        );

        monitor.start(link.clone(), "room", Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(monitor.is_active());
        assert!(link.is_connected());
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn acks_keep_the_outstanding_count_down() {
        let hub = LoopbackHub::new();
        let link = joined_link(&hub, "carol").await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u64>();
        let mut monitor = HeartbeatMonitor::new(
            0,
            Callback::from(move |outstanding| {
                let _ = tx.send(outstanding);
            }),
        );
        monitor.start(link.clone(), "room", Duration::from_secs(1));
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            monitor.note_ack();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Acks keep at most one pulse outstanding.
        let mut seen = Vec::new();
        while let Ok(v) = rx.try_recv() {
            seen.push(v);
        }
        assert!(seen.iter().all(|v| *v == 1));
        assert_eq!(monitor.sent(), 3);
    }
}
