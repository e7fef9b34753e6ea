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

//! The session orchestrator.
//!
//! [`SessionHandle`] is the caller's side of one call session. Every method
//! forwards a command to the session's own task, which serializes commands
//! with link traffic, tier progress and timer expiries.

mod engine;
mod roles;
mod timers;

use self::engine::{Command, SessionCore};
use crate::config::SessionConfig;
use crate::diagnostics::{DiagEvent, DiagnosticsReporter};
use crate::error::{ConfigError, SessionError};
use crate::event_bus::SessionEventBus;
use crate::events::SessionEvent;
use crate::media::{FrameSink, MediaHandle, TrackKind};
use crate::state::{SessionState, SessionStatus};
use crate::tier::TierBackends;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use videocall_signaling::Callback;
use videocall_transport::LinkFactory;

fn ended() -> SessionError {
    SessionError::misuse("session has ended")
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    bus: SessionEventBus,
    diagnostics: flume::Receiver<DiagEvent>,
}

impl SessionHandle {
    /// Validate `config` and start the session task on the current tokio
    /// runtime. The session starts `Idle`.
    pub fn spawn(
        config: SessionConfig,
        link_factory: Arc<dyn LinkFactory>,
        backends: TierBackends,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let bus = SessionEventBus::new();
        let diag = DiagnosticsReporter::new();
        let diagnostics = diag.subscribe();

        let core = SessionCore::new(
            config,
            link_factory,
            backends,
            sink,
            connect_tx,
            status_tx,
            bus.clone(),
            diag,
        );
        tokio::spawn(core.run(commands_rx, connect_rx));

        Ok(Self {
            commands: commands_tx,
            status: status_rx,
            bus,
            diagnostics,
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).map_err(|_| ended())?;
        rx.await.map_err(|_| ended())?
    }

    /// Connect to the rendezvous service and ask to join `room_id` as
    /// `name`. Resolves once the join request is on the wire; roster
    /// confirmation and everything after it is reported through state
    /// changes.
    ///
    /// Repeating the call with the same arguments is a no-op. Unreachable
    /// signaling fails with [`ErrorClass::TerminalCapability`] and leaves the
    /// session in `Error`.
    ///
    /// [`ErrorClass::TerminalCapability`]: crate::ErrorClass::TerminalCapability
    pub async fn join_room(&self, room_id: &str, name: &str) -> Result<(), SessionError> {
        let room_id = room_id.to_string();
        let name = name.to_string();
        self.request(|reply| Command::Join {
            room_id,
            name,
            reply,
        })
        .await
    }

    /// Hand local capture to the session. The source is stopped when it is
    /// replaced or when the session ends.
    pub async fn supply_local_media(&self, source: MediaHandle) -> Result<(), SessionError> {
        self.request(|reply| Command::SupplyMedia { source, reply })
            .await
    }

    /// Flip the enabled flag of the local track of `kind`. Returns the new
    /// value. Never renegotiates.
    pub async fn toggle_local_track(&self, kind: TrackKind) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleTrack { kind, reply })
            .await
    }

    /// Release everything the session holds. Idempotent.
    pub async fn end_session(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::End { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Register an observer. It receives the current status right away and
    /// then one status per state transition, until the session ends.
    pub fn on_state_change(&self, handler: Callback<SessionStatus>) -> Result<(), SessionError> {
        self.commands
            .send(Command::Observe { handler })
            .map_err(|_| ended())
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// A watch on the latest status snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn events(&self) -> async_broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn diagnostics(&self) -> flume::Receiver<DiagEvent> {
        self.diagnostics.clone()
    }

    /// Wait until the published status satisfies `predicate`. `None` once
    /// the session task is gone.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<SessionStatus>
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let mut status = self.status.clone();
        let found = status.wait_for(|s| predicate(s)).await.ok()?.clone();
        Some(found)
    }
}
