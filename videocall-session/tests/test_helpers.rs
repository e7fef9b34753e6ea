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

//! Shared helpers for session integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use videocall_session::{
    FrameSink, RemoteMedia, SessionConfig, SessionHandle, SessionState, SessionStatus,
    SimulatedNetwork, TierKind, TrackKind,
};
use videocall_signaling::Callback;
use videocall_transport::LoopbackHub;

pub const ROOM: &str = "standup";
pub const WAIT: Duration = Duration::from_secs(120);

/// Ordered log shared by sinks and observers so tests can assert on the
/// interleaving of renders and state changes.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn position_after(&self, entry: &str, after: usize) -> Option<usize> {
        self.entries()
            .iter()
            .skip(after)
            .position(|e| e == entry)
            .map(|i| i + after)
    }
}

pub struct RecordingSink {
    pub trace: Trace,
    bound: Mutex<Option<RemoteMedia>>,
    binds: Mutex<usize>,
}

impl RecordingSink {
    pub fn new(trace: Trace) -> Arc<Self> {
        Arc::new(Self {
            trace,
            bound: Mutex::new(None),
            binds: Mutex::new(0),
        })
    }

    pub fn current(&self) -> Option<RemoteMedia> {
        self.bound.lock().unwrap().clone()
    }

    pub fn bind_calls(&self) -> usize {
        *self.binds.lock().unwrap()
    }
}

impl FrameSink for RecordingSink {
    fn bind(&self, remote: Option<RemoteMedia>) {
        match &remote {
            Some(media) => self.trace.push(format!("bind:{}", media.tier)),
            None => self.trace.push("bind:none".to_string()),
        }
        *self.binds.lock().unwrap() += 1;
        *self.bound.lock().unwrap() = remote;
    }
}

pub struct Participant {
    pub name: String,
    pub session: SessionHandle,
    pub sink: Arc<RecordingSink>,
    pub trace: Trace,
    pub statuses: Arc<Mutex<Vec<SessionStatus>>>,
}

impl Participant {
    pub fn observed(&self) -> Vec<SessionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub async fn wait_for_state(&self, state: SessionState) -> SessionStatus {
        let found = tokio::time::timeout(WAIT, self.session.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "{} never reached {state}, stuck in {}",
                    self.name,
                    self.session.state()
                )
            });
        found.expect("session task exited")
    }

    pub async fn wait_until<F>(&self, what: &str, predicate: F) -> SessionStatus
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let found = tokio::time::timeout(WAIT, self.session.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for {what}", self.name));
        found.expect("session task exited")
    }

    pub async fn wait_connected(&self, tier: TierKind) -> SessionStatus {
        self.wait_for_state(SessionState::Connected(tier)).await
    }

    /// Remote tracks are announced one at a time; wait until the sink holds
    /// media with video in it.
    pub async fn wait_for_remote_video(&self) -> RemoteMedia {
        let poll = async {
            loop {
                if let Some(media) = self.sink.current().filter(|m| m.has(TrackKind::Video)) {
                    return media;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(WAIT, poll)
            .await
            .unwrap_or_else(|_| panic!("{} never rendered remote video", self.name))
    }
}

pub fn test_config(hub: &LoopbackHub) -> SessionConfig {
    let mut config = SessionConfig::with_urls([hub.url()]);
    config.reconnect.jitter = 0.0;
    config
}

pub fn spawn_participant(
    name: &str,
    config: SessionConfig,
    hub: &LoopbackHub,
    net: &SimulatedNetwork,
) -> Participant {
    let trace = Trace::default();
    let sink = RecordingSink::new(trace.clone());
    let session = SessionHandle::spawn(
        config,
        Arc::new(hub.clone()),
        net.backends(),
        sink.clone(),
    )
    .expect("valid config");

    let statuses = Arc::new(Mutex::new(Vec::new()));
    {
        let statuses = statuses.clone();
        let trace = trace.clone();
        session
            .on_state_change(Callback::from(move |status: SessionStatus| {
                trace.push(format!("state:{}", status.state.name()));
                statuses.lock().unwrap().push(status);
            }))
            .expect("session running");
    }

    Participant {
        name: name.to_string(),
        session,
        sink,
        trace,
        statuses,
    }
}
