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

//! The session event loop.
//!
//! One task per session owns every piece of mutable state. Link callbacks,
//! tier events, timer expiries and caller commands all arrive as messages
//! and are handled one at a time, so no handler ever observes a half-applied
//! transition.

use super::roles;
use super::timers::{fire, TimerKind, Timers};
use crate::config::SessionConfig;
use crate::diagnostics::{now_ms, DiagnosticsReporter};
use crate::error::{ErrorClass, SessionError};
use crate::event_bus::SessionEventBus;
use crate::events::SessionEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::media::{FrameSink, MediaHandle, TrackKind};
use crate::metric;
use crate::reconnect::ReconnectionPolicy;
use crate::relay_codec::RelayFrameCodec;
use crate::state::{
    AttemptOutcome, Role, SessionState, SessionStatus, TierKind, TransportAttempt,
};
use crate::tier::{
    tier_for_payload, NativeTier, RelayTier, SecondaryTier, TierBackends, TierEvent, TierState,
    TransportTier,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use videocall_signaling::{Callback, Payload, SignalingMessage, SERVICE_SENDER_ID};
use videocall_transport::{LinkError, LinkFactory, SignalingLink};

/// Buffered early signals beyond this are dropped oldest-first.
const EARLY_SIGNAL_LIMIT: usize = 256;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Join {
        room_id: String,
        name: String,
        reply: Reply<()>,
    },
    SupplyMedia {
        source: MediaHandle,
        reply: Reply<()>,
    },
    ToggleTrack {
        kind: TrackKind,
        reply: Reply<bool>,
    },
    Observe {
        handler: Callback<SessionStatus>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
}

enum LinkEvent {
    Message(SignalingMessage),
    Lost(String),
}

pub(crate) struct ConnectOutcome {
    generation: u64,
    result: Result<String, LinkError>,
}

async fn next_event<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn same_source(a: &MediaHandle, b: &MediaHandle) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub(crate) struct SessionCore {
    config: SessionConfig,
    link_factory: Arc<dyn LinkFactory>,
    backends: TierBackends,
    sink: Arc<dyn FrameSink>,
    policy: Arc<dyn ReconnectionPolicy>,
    codec: RelayFrameCodec,

    state: SessionState,
    room_id: Option<String>,
    local_name: Option<String>,
    participants: Vec<String>,
    seniors: Option<Vec<String>>,
    peer: Option<String>,
    role: Option<Role>,

    link: Option<Arc<dyn SignalingLink>>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    link_generation: u64,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    pending_join: Option<Reply<()>>,

    heartbeat: HeartbeatMonitor,
    media: Option<MediaHandle>,

    tier: Option<Box<dyn TransportTier>>,
    tier_events: Option<mpsc::UnboundedReceiver<TierEvent>>,
    attempts: Vec<TransportAttempt>,
    early_signals: Vec<Payload>,
    remote_bound: bool,

    timers: Timers,
    reconnect_attempt: u32,

    observers: Vec<Callback<SessionStatus>>,
    status_tx: watch::Sender<SessionStatus>,
    bus: SessionEventBus,
    diag: DiagnosticsReporter,
}

impl SessionCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SessionConfig,
        link_factory: Arc<dyn LinkFactory>,
        backends: TierBackends,
        sink: Arc<dyn FrameSink>,
        connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
        status_tx: watch::Sender<SessionStatus>,
        bus: SessionEventBus,
        diag: DiagnosticsReporter,
    ) -> Self {
        let heartbeat = {
            let bus = bus.clone();
            HeartbeatMonitor::new(
                config.heartbeat_ack_grace,
                Callback::from(move |outstanding| {
                    bus.emit(SessionEvent::HeartbeatMissed { outstanding })
                }),
            )
        };
        let policy = config.reconnect.policy();
        let codec = RelayFrameCodec::new(config.relay_max_dimension, config.relay_jpeg_quality);
        Self {
            config,
            link_factory,
            backends,
            sink,
            policy,
            codec,
            state: SessionState::Idle,
            room_id: None,
            local_name: None,
            participants: Vec::new(),
            seniors: None,
            peer: None,
            role: None,
            link: None,
            link_events: None,
            link_generation: 0,
            connect_tx,
            pending_join: None,
            heartbeat,
            media: None,
            tier: None,
            tier_events: None,
            attempts: Vec::new(),
            early_signals: Vec::new(),
            remote_bound: false,
            timers: Timers::default(),
            reconnect_attempt: 0,
            observers: Vec::new(),
            status_tx,
            bus,
            diag,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connects: mpsc::UnboundedReceiver<ConnectOutcome>,
    ) {
        loop {
            let next_timer = self.timers.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("every session handle dropped, shutting down");
                        self.shutdown();
                    }
                },
                Some(outcome) = connects.recv() => self.on_connect_outcome(outcome),
                event = next_event(&mut self.link_events) => self.on_link_event(event),
                event = next_event(&mut self.tier_events) => self.on_tier_event(event),
                kind = fire(next_timer) => {
                    self.timers.cancel(kind);
                    self.on_timer(kind);
                }
            }
            if self.state == SessionState::Ended {
                break;
            }
        }
        debug!("session loop for {} exited", self.who());
    }

    fn who(&self) -> String {
        format!(
            "{}@{}",
            self.local_name.as_deref().unwrap_or("-"),
            self.room_id.as_deref().unwrap_or("-")
        )
    }

    // === Caller commands ===

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join {
                room_id,
                name,
                reply,
            } => self.join(room_id, name, reply),
            Command::SupplyMedia { source, reply } => {
                let _ = reply.send(self.supply_media(source));
            }
            Command::ToggleTrack { kind, reply } => {
                let _ = reply.send(self.toggle_track(kind));
            }
            Command::Observe { handler } => {
                handler.emit(self.snapshot());
                self.observers.push(handler);
            }
            Command::End { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn terminal_error(&self) -> Option<SessionError> {
        match &self.state {
            SessionState::Ended => Some(SessionError::misuse("session has ended")),
            SessionState::Error { class, reason } => Some(SessionError::misuse(format!(
                "session failed ({class}: {reason}); create a new session"
            ))),
            _ => None,
        }
    }

    fn join(&mut self, room_id: String, name: String, reply: Reply<()>) {
        if let Some(err) = self.terminal_error() {
            let _ = reply.send(Err(err));
            return;
        }
        if self.state != SessionState::Idle {
            let same = self.room_id.as_deref() == Some(room_id.as_str())
                && self.local_name.as_deref() == Some(name.as_str());
            let result = if same {
                debug!("duplicate join for {} ignored", self.who());
                Ok(())
            } else {
                Err(SessionError::misuse(format!(
                    "already joined as {}",
                    self.who()
                )))
            };
            let _ = reply.send(result);
            return;
        }
        if room_id.is_empty() || name.is_empty() {
            let _ = reply.send(Err(SessionError::misuse(
                "room id and name must be non-empty",
            )));
            return;
        }
        if name == SERVICE_SENDER_ID {
            let _ = reply.send(Err(SessionError::misuse(format!(
                "{name} is reserved for the rendezvous service"
            ))));
            return;
        }

        self.diag.set_stream_id(&name);
        self.room_id = Some(room_id);
        self.local_name = Some(name);
        self.begin_join(Some(reply));
    }

    fn supply_media(&mut self, source: MediaHandle) -> Result<(), SessionError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        match self.state.clone() {
            SessionState::Idle => Err(SessionError::misuse(
                "join a room before supplying media",
            )),
            SessionState::Joining | SessionState::Disconnected => {
                info!("{}: media held until the room is joined", self.who());
                self.replace_media(source);
                Ok(())
            }
            SessionState::AwaitingMedia => {
                self.replace_media(source);
                self.activate_media();
                Ok(())
            }
            SessionState::MediaActive => {
                self.replace_media(source);
                self.maybe_negotiate();
                Ok(())
            }
            SessionState::Negotiating(tier) | SessionState::Connected(tier) => {
                info!(
                    "{}: media replaced while on {tier}, renegotiating",
                    self.who()
                );
                self.restart_cycle(Some(source));
                Ok(())
            }
            SessionState::Ended | SessionState::Error { .. } => {
                Err(SessionError::misuse("session is not running"))
            }
        }
    }

    fn replace_media(&mut self, source: MediaHandle) {
        if let Some(old) = self.media.replace(source.clone()) {
            if !same_source(&old, &source) {
                debug!("stopping replaced media source {}", old.id());
                old.stop();
            }
        }
    }

    fn toggle_track(&mut self, kind: TrackKind) -> Result<bool, SessionError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let Some(media) = &self.media else {
            return Err(SessionError::misuse("no local media supplied"));
        };
        let tracks = media.tracks();
        let Some(track) = tracks.get(kind) else {
            return Err(SessionError::misuse(format!(
                "local media has no {kind} track"
            )));
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        info!("{}: local {kind} {}", self.who(), if enabled { "enabled" } else { "disabled" });
        self.bus
            .emit(SessionEvent::LocalTrackToggled { kind, enabled });
        Ok(enabled)
    }

    fn shutdown(&mut self) {
        if self.state == SessionState::Ended {
            return;
        }
        info!("{}: ending session", self.who());
        if let Some(reply) = self.pending_join.take() {
            let _ = reply.send(Err(SessionError::misuse(
                "session ended before the join completed",
            )));
        }
        self.release_resources();
        self.transition(SessionState::Ended);
        self.observers.clear();
    }

    // === Signaling link ===

    fn begin_join(&mut self, reply: Option<Reply<()>>) {
        self.transition(SessionState::Joining);
        self.participants.clear();
        self.seniors = None;

        let link = self.link_factory.create();
        let (tx, rx) = mpsc::unbounded_channel();
        link.on_message(Callback::from({
            let tx = tx.clone();
            move |msg| {
                let _ = tx.send(LinkEvent::Message(msg));
            }
        }));
        link.on_disconnected(Callback::from(move |reason| {
            let _ = tx.send(LinkEvent::Lost(reason));
        }));

        self.link_generation += 1;
        let generation = self.link_generation;
        self.link = Some(link.clone());
        self.link_events = Some(rx);
        self.pending_join = reply;

        let urls = self.config.signaling_urls.clone();
        let outcomes = self.connect_tx.clone();
        tokio::spawn(async move {
            let result = link.connect(&urls).await;
            let _ = outcomes.send(ConnectOutcome { generation, result });
        });
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.generation != self.link_generation || self.state != SessionState::Joining {
            debug!("{}: ignoring outcome of an abandoned connect", self.who());
            return;
        }
        match outcome.result {
            Ok(url) => {
                let (Some(room), Some(name)) = (self.room_id.clone(), self.local_name.clone())
                else {
                    return;
                };
                info!("{name} reached {url}, joining room {room}");
                let sent = match &self.link {
                    Some(link) => link.send(SignalingMessage::join(&room, &name)),
                    None => Err(LinkError::NotConnected),
                };
                if let Err(e) = sent {
                    self.join_failed(format!("could not send join: {e}"));
                    return;
                }
                self.timers
                    .arm(TimerKind::JoinFallback, self.config.join_fallback());
                self.publish_status();
                if let Some(reply) = self.pending_join.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                warn!("{}: rendezvous service unreachable: {e}", self.who());
                self.join_failed(e.to_string());
            }
        }
    }

    fn join_failed(&mut self, reason: String) {
        self.teardown_link();
        self.timers.cancel(TimerKind::JoinFallback);
        if self.reconnect_attempt > 0 {
            self.transition(SessionState::Disconnected);
            self.schedule_reconnect();
            return;
        }
        let reply = self.pending_join.take();
        self.fail(ErrorClass::TerminalCapability, reason.clone());
        if let Some(reply) = reply {
            let _ = reply.send(Err(SessionError::terminal(reason)));
        }
    }

    fn teardown_link(&mut self) {
        self.link_events = None;
        if let Some(link) = self.link.take() {
            link.clear_handlers();
            link.close();
        }
        self.link_generation += 1;
    }

    fn on_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            None => self.link_events = None,
            Some(LinkEvent::Message(msg)) => self.on_message(msg),
            Some(LinkEvent::Lost(reason)) => self.on_link_lost(reason),
        }
    }

    fn on_message(&mut self, msg: SignalingMessage) {
        if self.room_id.as_deref() != Some(msg.room_id.as_str()) {
            debug!("{}: dropping message for room {}", self.who(), msg.room_id);
            return;
        }
        match msg.payload {
            Payload::RosterChanged { participants } => self.on_roster(participants),
            Payload::HeartbeatAck => self.heartbeat.note_ack(),
            Payload::Renegotiate => self.on_peer_restart(),
            Payload::Heartbeat | Payload::JoinRoom { .. } => {
                debug!("{}: ignoring {} from service", self.who(), msg.message_type())
            }
            payload => self.on_peer_signal(payload),
        }
    }

    fn on_link_lost(&mut self, reason: String) {
        match self.state {
            SessionState::Joining => {
                warn!("{}: link lost while joining: {reason}", self.who());
                self.join_failed(reason);
            }
            SessionState::AwaitingMedia
            | SessionState::MediaActive
            | SessionState::Negotiating(_)
            | SessionState::Connected(_) => {
                warn!("{}: signaling link lost: {reason}", self.who());
                self.enter_disconnected();
            }
            _ => debug!("{}: link loss ignored in {}", self.who(), self.state),
        }
    }

    fn send_to_peer(&mut self, payload: Payload) {
        let (Some(link), Some(room)) = (&self.link, &self.room_id) else {
            debug!("no link, dropping outbound {}", payload.message_type());
            return;
        };
        let kind = payload.message_type();
        if let Err(e) = link.send(SignalingMessage::new(room.clone(), payload)) {
            debug!("{}: could not send {kind}: {e}", self.who());
        }
    }

    // === Roster ===

    fn on_roster(&mut self, participants: Vec<String>) {
        let mut roster: Vec<String> = Vec::with_capacity(participants.len());
        for participant in participants {
            if !roster.contains(&participant) {
                roster.push(participant);
            }
        }
        let local = self.local_name.clone().unwrap_or_default();
        let previous = std::mem::replace(&mut self.participants, roster.clone());
        for joined in roster.iter().filter(|p| **p != local && !previous.contains(p)) {
            self.bus.emit(SessionEvent::PeerJoined(joined.clone()));
        }
        for left in previous.iter().filter(|p| **p != local && !roster.contains(p)) {
            info!("{}: {left} left the room", self.who());
            self.bus.emit(SessionEvent::PeerLeft(left.clone()));
        }
        if let Some(seniors) = &mut self.seniors {
            seniors.retain(|s| roster.contains(s));
        }
        self.publish_status();

        match self.state.clone() {
            SessionState::Joining if roster.contains(&local) => self.on_joined(false),
            SessionState::MediaActive => self.maybe_negotiate(),
            SessionState::Negotiating(_) | SessionState::Connected(_) => {
                if let Some(peer) = self.peer.clone() {
                    if !roster.contains(&peer) {
                        self.on_peer_left(&peer);
                    }
                }
            }
            _ => {}
        }
    }

    fn on_joined(&mut self, assumed: bool) {
        self.timers.cancel(TimerKind::JoinFallback);
        let local = self.local_name.clone().unwrap_or_default();
        self.seniors = if assumed {
            None
        } else {
            Some(
                self.participants
                    .iter()
                    .filter(|p| **p != local)
                    .cloned()
                    .collect(),
            )
        };
        if self.reconnect_attempt > 0 {
            info!(
                "{}: rejoined after {} attempt(s)",
                self.who(),
                self.reconnect_attempt
            );
            self.diag.report(
                "reconnect",
                vec![
                    metric!("outcome", "rejoined"),
                    metric!("attempts", self.reconnect_attempt),
                ],
            );
            self.reconnect_attempt = 0;
        }
        self.transition(SessionState::AwaitingMedia);
        if self.media.is_some() {
            self.activate_media();
        }
    }

    fn on_peer_left(&mut self, peer: &str) {
        info!("{}: peer {peer} left, dropping media path", self.who());
        self.finish_attempt(AttemptOutcome::Aborted);
        self.stop_tier();
        self.reset_cycle();
        self.transition(SessionState::MediaActive);
        self.maybe_negotiate();
    }

    fn reset_cycle(&mut self) {
        self.peer = None;
        self.role = None;
        self.early_signals.clear();
    }

    /// Drop the current media path and negotiate again from the top tier.
    /// A local media swap tells the peer to start over too, so both sides
    /// open fresh channels and the initiator sends a fresh offer.
    fn restart_cycle(&mut self, replacement: Option<MediaHandle>) {
        self.finish_attempt(AttemptOutcome::Aborted);
        self.stop_tier();
        if let Some(source) = replacement {
            self.replace_media(source);
            self.send_to_peer(Payload::Renegotiate);
        }
        self.reset_cycle();
        self.transition(SessionState::MediaActive);
        self.maybe_negotiate();
    }

    fn on_peer_restart(&mut self) {
        match self.state {
            SessionState::Negotiating(_) | SessionState::Connected(_) => {
                info!("{}: peer restarted negotiation, following", self.who());
                self.restart_cycle(None);
            }
            // Whatever was buffered belongs to the abandoned attempt.
            SessionState::AwaitingMedia | SessionState::MediaActive => self.early_signals.clear(),
            _ => debug!("{}: ignoring renegotiate in {}", self.who(), self.state),
        }
    }

    // === Negotiation ===

    fn activate_media(&mut self) {
        self.transition(SessionState::MediaActive);
        self.maybe_negotiate();
    }

    fn maybe_negotiate(&mut self) {
        if self.state != SessionState::MediaActive || self.media.is_none() {
            return;
        }
        let local = self.local_name.clone().unwrap_or_default();
        let seniors = self.seniors.as_deref();
        let Some(peer) = roles::select_partner(&local, &self.participants, seniors) else {
            return;
        };
        let role = roles::derive_role(&local, &peer, seniors);
        info!("{}: negotiating with {peer} as {role}", self.who());
        self.peer = Some(peer.clone());
        self.role = Some(role);
        self.attempts.clear();
        self.bus.emit(SessionEvent::PeerSelected { peer, role });
        self.start_tier(TierKind::Native);
    }

    fn build_tier(&self, kind: TierKind, room: &str) -> Box<dyn TransportTier> {
        match kind {
            TierKind::Native => Box::new(NativeTier::new(self.backends.native.clone())),
            TierKind::Secondary => Box::new(SecondaryTier::new(self.backends.secondary.clone())),
            TierKind::Relay => Box::new(RelayTier::new(
                room,
                self.codec,
                self.config.relay_frame_interval(),
            )),
        }
    }

    fn tier_timeout(&self, kind: TierKind) -> Option<Duration> {
        match kind {
            TierKind::Native => Some(Duration::from_millis(self.config.native_timeout_ms)),
            TierKind::Secondary => Some(Duration::from_millis(self.config.secondary_timeout_ms)),
            TierKind::Relay => None,
        }
    }

    fn start_tier(&mut self, requested: TierKind) {
        let (Some(media), Some(room)) = (self.media.clone(), self.room_id.clone()) else {
            return;
        };
        // The peer may already be further down the ladder.
        let kind = match self.early_signals.iter().filter_map(tier_for_payload).max() {
            Some(floor) if floor > requested => {
                info!("{}: peer is already on {floor}, skipping {requested}", self.who());
                floor
            }
            _ => requested,
        };
        if let Some(last) = self.attempts.last().map(|a| a.tier) {
            if kind < last {
                error!("{}: refusing to climb back from {last} to {kind}", self.who());
                return;
            }
        }

        let mut tier = self.build_tier(kind, &room);
        let (tx, rx) = mpsc::unbounded_channel();
        self.attempts.push(TransportAttempt {
            tier: kind,
            started_at_ms: now_ms(),
            outcome: AttemptOutcome::Pending,
        });
        self.transition(SessionState::Negotiating(kind));
        self.bus.emit(SessionEvent::TierAttemptStarted(kind));

        let initiator = self.role.is_some_and(Role::is_initiator);
        if let Err(e) = tier.start(media, initiator, tx) {
            tier.stop();
            self.fall_back(kind, kind.next(), format!("could not start: {e}"));
            return;
        }
        self.tier = Some(tier);
        self.tier_events = Some(rx);
        if let Some(timeout) = self.tier_timeout(kind) {
            self.timers.arm(TimerKind::TierTimeout, timeout);
        }
        self.publish_status();
        self.replay_early_signals(kind);
    }

    fn replay_early_signals(&mut self, kind: TierKind) {
        let early = std::mem::take(&mut self.early_signals);
        for payload in early {
            match tier_for_payload(&payload) {
                Some(tier) if tier == kind => self.deliver_to_tier(payload),
                Some(tier) if tier > kind => self.early_signals.push(payload),
                _ => debug!("discarding stale {}", payload.message_type()),
            }
        }
    }

    fn deliver_to_tier(&mut self, payload: Payload) {
        let Some(tier) = self.tier.as_mut() else {
            return;
        };
        tier.handle_signal(&payload);
    }

    fn buffer_early(&mut self, payload: Payload) {
        if matches!(payload, Payload::RelayFrame { .. }) {
            self.early_signals
                .retain(|p| !matches!(p, Payload::RelayFrame { .. }));
        }
        if self.early_signals.len() >= EARLY_SIGNAL_LIMIT {
            warn!("{}: early signal buffer full, dropping oldest", self.who());
            self.early_signals.remove(0);
        }
        self.early_signals.push(payload);
    }

    fn on_peer_signal(&mut self, payload: Payload) {
        let Some(signal_tier) = tier_for_payload(&payload) else {
            return;
        };
        match self.state.clone() {
            SessionState::AwaitingMedia | SessionState::MediaActive => self.buffer_early(payload),
            SessionState::Negotiating(current) if signal_tier == current => {
                let glare = current == TierKind::Native
                    && self.role == Some(Role::Initiator)
                    && matches!(payload, Payload::Offer { .. });
                if glare {
                    self.on_glare(payload);
                } else {
                    self.deliver_to_tier(payload);
                }
            }
            SessionState::Negotiating(current) if signal_tier > current => {
                info!(
                    "{}: peer already fell back to {signal_tier}, following",
                    self.who()
                );
                self.buffer_early(payload);
                self.fall_back(current, Some(signal_tier), format!("peer moved to {signal_tier}"));
            }
            SessionState::Connected(current) if signal_tier == current => {
                self.deliver_to_tier(payload)
            }
            SessionState::Connected(current) if signal_tier > current => {
                self.on_carrier_lost(format!("peer abandoned {current} for {signal_tier}"));
            }
            _ => debug!(
                "{}: dropping {} in {}",
                self.who(),
                payload.message_type(),
                self.state
            ),
        }
    }

    fn on_glare(&mut self, offer: Payload) {
        let local = self.local_name.clone().unwrap_or_default();
        let peer = self.peer.clone().unwrap_or_default();
        if roles::keeps_initiator_on_glare(&local, &peer) {
            info!("{}: both sides offered, keeping the initiator role", self.who());
            return;
        }
        info!("{}: both sides offered, answering {peer} instead", self.who());
        self.finish_attempt(AttemptOutcome::Aborted);
        self.stop_tier();
        self.role = Some(Role::Responder);
        self.early_signals
            .retain(|p| tier_for_payload(p) != Some(TierKind::Native));
        self.buffer_early(offer);
        self.start_tier(TierKind::Native);
    }

    fn on_tier_event(&mut self, event: Option<TierEvent>) {
        let Some(event) = event else {
            self.tier_events = None;
            return;
        };
        let Some(kind) = self.tier.as_ref().map(|t| t.kind()) else {
            return;
        };
        match event {
            TierEvent::Signal(payload) => self.send_to_peer(payload),
            TierEvent::RemoteMedia(media) => {
                info!("{}: remote media {} bound from {kind}", self.who(), media.id);
                self.sink.bind(Some(media));
                self.remote_bound = true;
                self.bus.emit(SessionEvent::RemoteMediaBound(kind));
                self.publish_status();
            }
            TierEvent::StateChange(TierState::Connected) => {
                if self.state == SessionState::Negotiating(kind) {
                    self.timers.cancel(TimerKind::TierTimeout);
                    self.finish_attempt(AttemptOutcome::Connected);
                    self.transition(SessionState::Connected(kind));
                }
            }
            TierEvent::StateChange(TierState::Failed(reason)) => match self.state {
                SessionState::Negotiating(current) if current == kind => {
                    self.fall_back(kind, kind.next(), reason)
                }
                SessionState::Connected(current) if current == kind => {
                    self.on_carrier_lost(reason)
                }
                _ => {}
            },
        }
    }

    /// Abandon `from` and start `to`, or give up on the media path entirely
    /// when there is nothing left to try.
    fn fall_back(&mut self, from: TierKind, to: Option<TierKind>, reason: String) {
        self.finish_attempt(AttemptOutcome::Failed(reason.clone()));
        self.stop_tier();
        self.early_signals
            .retain(|p| tier_for_payload(p) > Some(from));
        match to {
            Some(next) => {
                warn!("{}: {from} tier failed ({reason}), trying {next}", self.who());
                self.bus.emit(SessionEvent::TierDegraded {
                    from,
                    to: next,
                    reason,
                });
                self.start_tier(next);
            }
            None => {
                error!("{}: {from} tier failed ({reason}), nothing left to try", self.who());
                self.on_carrier_lost(reason);
            }
        }
    }

    fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        let Some(attempt) = self.attempts.last_mut() else {
            return;
        };
        if attempt.outcome != AttemptOutcome::Pending {
            return;
        }
        let elapsed = now_ms().saturating_sub(attempt.started_at_ms);
        let label = match &outcome {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Connected => "connected",
            AttemptOutcome::Failed(_) => "failed",
            AttemptOutcome::Aborted => "aborted",
        };
        let tier = attempt.tier;
        attempt.outcome = outcome;
        self.diag.report(
            "tier",
            vec![
                metric!("tier", tier.as_str()),
                metric!("outcome", label),
                metric!("elapsed_ms", elapsed),
            ],
        );
    }

    fn stop_tier(&mut self) {
        self.timers.cancel(TimerKind::TierTimeout);
        self.tier_events = None;
        if let Some(mut tier) = self.tier.take() {
            tier.stop();
        }
        self.clear_remote_media();
    }

    fn clear_remote_media(&mut self) {
        if self.remote_bound {
            self.sink.bind(None);
            self.remote_bound = false;
            self.bus.emit(SessionEvent::RemoteMediaCleared);
        }
    }

    // === Failure handling ===

    fn on_carrier_lost(&mut self, reason: String) {
        warn!("{}: media path lost: {reason}", self.who());
        self.enter_disconnected();
    }

    fn enter_disconnected(&mut self) {
        self.finish_attempt(AttemptOutcome::Aborted);
        self.stop_tier();
        self.teardown_link();
        self.timers.cancel(TimerKind::JoinFallback);
        self.reset_cycle();
        self.transition(SessionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;
        match self.policy.delay(attempt) {
            Some(delay) => {
                info!(
                    "{}: reconnect attempt {attempt}/{} in {delay:?}",
                    self.who(),
                    self.policy.max_attempts()
                );
                self.timers.arm(TimerKind::Reconnect, delay);
                let delay_ms = delay.as_millis() as u64;
                self.bus
                    .emit(SessionEvent::ReconnectScheduled { attempt, delay_ms });
                self.diag.report(
                    "reconnect",
                    vec![metric!("attempt", attempt), metric!("delay_ms", delay_ms)],
                );
                self.publish_status();
            }
            None => {
                let reason = format!("gave up after {} reconnect attempts", attempt - 1);
                error!("{}: {reason}", self.who());
                self.fail(ErrorClass::TerminalCapability, reason);
            }
        }
    }

    fn fail(&mut self, class: ErrorClass, reason: String) {
        self.release_resources();
        self.transition(SessionState::Error { class, reason });
    }

    fn release_resources(&mut self) {
        self.finish_attempt(AttemptOutcome::Aborted);
        self.stop_tier();
        self.teardown_link();
        self.heartbeat.stop();
        self.timers.clear();
        self.reset_cycle();
        if let Some(media) = self.media.take() {
            media.stop();
        }
    }

    // === Timers ===

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::JoinFallback => {
                if self.state != SessionState::Joining {
                    return;
                }
                if self.link.as_ref().is_some_and(|l| l.is_connected()) {
                    warn!(
                        "{}: no roster within {}ms, assuming the join went through",
                        self.who(),
                        self.config.join_fallback_ms
                    );
                    self.on_joined(true);
                } else {
                    self.join_failed("rendezvous service never confirmed the join".into());
                }
            }
            TimerKind::TierTimeout => {
                if let SessionState::Negotiating(tier) = self.state {
                    let budget = self.tier_timeout(tier).unwrap_or_default();
                    warn!(
                        "{}: {} after {budget:?} on {tier}",
                        self.who(),
                        ErrorClass::NegotiationTimeout
                    );
                    self.fall_back(tier, tier.next(), format!("not connected within {budget:?}"));
                }
            }
            TimerKind::Reconnect => {
                if self.state == SessionState::Disconnected {
                    info!(
                        "{}: reconnecting (attempt {})",
                        self.who(),
                        self.reconnect_attempt
                    );
                    self.begin_join(None);
                }
            }
        }
    }

    // === Observation ===

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next.clone());
        if next == SessionState::AwaitingMedia {
            if let (Some(link), Some(room)) = (self.link.clone(), self.room_id.clone()) {
                self.heartbeat
                    .start(link, &room, self.config.heartbeat_interval());
            }
        } else {
            self.heartbeat.stop();
        }
        info!("{}: {previous} -> {next}", self.who());
        self.diag.report(
            "session",
            vec![
                metric!("from", previous.name()),
                metric!("to", next.name()),
                metric!("tier", next.tier().map(TierKind::as_str).unwrap_or("none")),
            ],
        );
        self.bus.emit(SessionEvent::StateChanged {
            from: previous,
            to: next,
        });
        let status = self.publish_status();
        for observer in &self.observers {
            observer.emit(status.clone());
        }
    }

    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            state: self.state.clone(),
            room_id: self.room_id.clone(),
            local_name: self.local_name.clone(),
            participants: self.participants.clone(),
            peer: self.peer.clone(),
            role: self.role,
            heartbeat_active: self.heartbeat.is_active(),
            pending_timers: self.timers.len(),
            reconnect_attempt: self.reconnect_attempt,
            remote_media_bound: self.remote_bound,
            attempts: self.attempts.clone(),
        }
    }

    fn publish_status(&self) -> SessionStatus {
        let status = self.snapshot();
        self.status_tx.send_replace(status.clone());
        status
    }
}
