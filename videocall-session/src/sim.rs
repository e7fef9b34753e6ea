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

//! In-process peer network implementing both negotiated-tier backends.
//!
//! Channels opened from one [`SimulatedNetwork`] find each other through the
//! descriptions they exchange, exactly as real ones would through signaling,
//! and then stream each side's test-pattern video to the other. Per-tier
//! switches make a tier fail, hang, go silent or be missing altogether, which
//! is how tests and the demo exercise degradation.

use crate::error::PeerError;
use crate::media::{MediaHandle, TrackKind, VideoFrame};
use crate::tier::{
    PeerChannel, PeerConnector, PeerEvent, PeerEventSender, PeerTransportState, SecondaryChannel,
    SecondaryConnector, TierBackends,
};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const NATIVE_OFFER: &str = "sim-native-offer:";
const NATIVE_ANSWER: &str = "sim-native-answer:";
const SECONDARY_INIT: &str = "sim-secondary-init:";
const SECONDARY_REPLY: &str = "sim-secondary-reply:";
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

/// How a simulated tier behaves once both sides have exchanged descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBehavior {
    Works,
    /// The transport reports `Failed` on both sides.
    Fails,
    /// Nothing happens; the session's tier timeout has to catch it.
    Hangs,
    /// Transport connects but no remote track ever arrives.
    Silent,
    /// The backend cannot open a channel at all.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Flavor {
    Native,
    Secondary,
}

struct Side {
    events: PeerEventSender,
    local: Option<MediaHandle>,
    remote_candidates: usize,
    closed: bool,
    pumps: Vec<JoinHandle<()>>,
}

impl Side {
    fn new(events: PeerEventSender) -> Self {
        Self {
            events,
            local: None,
            remote_candidates: 0,
            closed: false,
            pumps: Vec::new(),
        }
    }

    fn send(&self, event: PeerEvent) {
        if !self.closed {
            let _ = self.events.send(event);
        }
    }

    fn shutdown(&mut self) {
        self.closed = true;
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Position {
    Offerer,
    Answerer,
}

struct Pair {
    flavor: Flavor,
    offerer: Side,
    answerer: Option<Side>,
    answer_applied: bool,
    settled: bool,
}

impl Pair {
    fn side_mut(&mut self, position: Position) -> Option<&mut Side> {
        match position {
            Position::Offerer => Some(&mut self.offerer),
            Position::Answerer => self.answerer.as_mut(),
        }
    }
}

struct NetState {
    native: SimBehavior,
    secondary: SimBehavior,
    next_id: u64,
    /// Channels opened but not yet part of a pair, keyed by channel id.
    unpaired: HashMap<u64, Side>,
    pairs: HashMap<u64, Pair>,
    established: usize,
}

/// Cheap to clone; clones share one network.
#[derive(Clone)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetState>>,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState {
                native: SimBehavior::Works,
                secondary: SimBehavior::Works,
                next_id: 0,
                unpaired: HashMap::new(),
                pairs: HashMap::new(),
                established: 0,
            })),
        }
    }

    pub fn set_native(&self, behavior: SimBehavior) {
        self.lock().native = behavior;
    }

    pub fn set_secondary(&self, behavior: SimBehavior) {
        self.lock().secondary = behavior;
    }

    pub fn backends(&self) -> TierBackends {
        TierBackends::new(
            Arc::new(NativeSim(self.clone())),
            Arc::new(SecondarySim(self.clone())),
        )
    }

    /// Pairs that reached a working media path so far.
    pub fn established(&self) -> usize {
        self.lock().established
    }

    /// Break every established pair, as if the network path died.
    pub fn sever_all(&self) -> usize {
        let mut state = self.lock();
        let mut severed = 0;
        for pair in state.pairs.values_mut().filter(|p| p.settled) {
            for position in [Position::Offerer, Position::Answerer] {
                if let Some(side) = pair.side_mut(position) {
                    side.send(PeerEvent::TransportState(PeerTransportState::Failed));
                    side.shutdown();
                }
            }
            severed += 1;
        }
        info!("simulated network severed {severed} pairs");
        severed
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn open(&self, flavor: Flavor, events: PeerEventSender) -> Result<u64, PeerError> {
        let mut state = self.lock();
        let behavior = match flavor {
            Flavor::Native => state.native,
            Flavor::Secondary => state.secondary,
        };
        if behavior == SimBehavior::Unavailable {
            return Err(PeerError::Unavailable(format!("{flavor:?} backend switched off")));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.unpaired.insert(id, Side::new(events));
        Ok(id)
    }

    fn attach_local(&self, link: &ChannelLink, local: &MediaHandle) {
        let mut state = self.lock();
        match link {
            ChannelLink::Unpaired(id) => {
                if let Some(side) = state.unpaired.get_mut(id) {
                    side.local = Some(local.clone());
                }
            }
            ChannelLink::Paired(pair, position) => {
                if let Some(side) = state.pairs.get_mut(pair).and_then(|p| p.side_mut(*position)) {
                    side.local = Some(local.clone());
                }
            }
        }
    }

    /// Turn an unpaired channel into the offering side of a new pair.
    fn offer(&self, flavor: Flavor, id: u64) -> Result<u64, PeerError> {
        let mut state = self.lock();
        let side = state.unpaired.remove(&id).ok_or(PeerError::Closed)?;
        state.pairs.insert(
            id,
            Pair {
                flavor,
                offerer: side,
                answerer: None,
                answer_applied: false,
                settled: false,
            },
        );
        if flavor == Flavor::Native {
            if let Some(pair) = state.pairs.get(&id) {
                pair.offerer
                    .send(PeerEvent::LocalCandidate(format!("sim-candidate:{id}:host")));
                pair.offerer
                    .send(PeerEvent::TransportState(PeerTransportState::Connecting));
            }
        }
        Ok(id)
    }

    /// Join the unpaired channel `id` to the pair named by `description`.
    fn answer(&self, flavor: Flavor, id: u64, pair_id: u64) -> Result<(), PeerError> {
        let mut state = self.lock();
        let side = state.unpaired.remove(&id).ok_or(PeerError::Closed)?;
        let Some(pair) = state.pairs.get_mut(&pair_id) else {
            return Err(PeerError::Negotiation(format!("no pending offer {pair_id}")));
        };
        if pair.flavor != flavor || pair.answerer.is_some() {
            return Err(PeerError::Negotiation(format!("offer {pair_id} already taken")));
        }
        if flavor == Flavor::Native {
            side.send(PeerEvent::LocalCandidate(format!(
                "sim-candidate:{pair_id}:answer"
            )));
            side.send(PeerEvent::TransportState(PeerTransportState::Connecting));
        }
        pair.answerer = Some(side);
        Ok(())
    }

    fn apply_answer(&self, pair_id: u64) -> Result<(), PeerError> {
        let mut state = self.lock();
        let pair = state.pairs.get_mut(&pair_id).ok_or(PeerError::Closed)?;
        if pair.answerer.is_none() {
            return Err(PeerError::Negotiation("answer for an unanswered offer".into()));
        }
        pair.answer_applied = true;
        Self::try_settle(&mut state, pair_id);
        Ok(())
    }

    fn add_candidate(&self, pair_id: u64, position: Position) -> Result<(), PeerError> {
        let mut state = self.lock();
        let pair = state.pairs.get_mut(&pair_id).ok_or(PeerError::Closed)?;
        let side = pair.side_mut(position).ok_or(PeerError::Closed)?;
        side.remote_candidates += 1;
        Self::try_settle(&mut state, pair_id);
        Ok(())
    }

    fn try_settle(state: &mut NetState, pair_id: u64) {
        let (native, secondary) = (state.native, state.secondary);
        let Some(pair) = state.pairs.get_mut(&pair_id) else {
            return;
        };
        if pair.settled || !pair.answer_applied {
            return;
        }
        if pair.flavor == Flavor::Native {
            let answerer_ready = pair
                .answerer
                .as_ref()
                .is_some_and(|a| a.remote_candidates > 0);
            if pair.offerer.remote_candidates == 0 || !answerer_ready {
                return;
            }
        }
        let behavior = match pair.flavor {
            Flavor::Native => native,
            Flavor::Secondary => secondary,
        };
        pair.settled = true;
        debug!("simulated {:?} pair {pair_id} settling as {behavior:?}", pair.flavor);

        let Some(answerer) = pair.answerer.as_mut() else {
            return;
        };
        let offerer = &mut pair.offerer;
        match behavior {
            SimBehavior::Works => {
                state.established += 1;
                connect_sides(offerer, answerer, true);
            }
            SimBehavior::Silent => connect_sides(offerer, answerer, false),
            SimBehavior::Fails => {
                for side in [&*offerer, &*answerer] {
                    side.send(PeerEvent::TransportState(PeerTransportState::Failed));
                }
            }
            SimBehavior::Hangs | SimBehavior::Unavailable => {}
        }
    }

    fn close(&self, link: &ChannelLink) {
        let mut state = self.lock();
        match link {
            ChannelLink::Unpaired(id) => {
                state.unpaired.remove(id);
            }
            ChannelLink::Paired(pair_id, position) => {
                let remove = match state.pairs.get_mut(pair_id) {
                    Some(pair) => {
                        if let Some(side) = pair.side_mut(*position) {
                            side.shutdown();
                        }
                        pair.offerer.closed && pair.answerer.as_ref().map_or(true, |a| a.closed)
                    }
                    None => false,
                };
                if remove {
                    state.pairs.remove(pair_id);
                }
            }
        }
    }
}

fn connect_sides(a: &mut Side, b: &mut Side, with_media: bool) {
    for side in [&*a, &*b] {
        side.send(PeerEvent::TransportState(PeerTransportState::Connected));
    }
    if !with_media {
        return;
    }
    let a_media = a.local.clone();
    let b_media = b.local.clone();
    deliver_tracks(a, b_media);
    deliver_tracks(b, a_media);
}

/// Announce `from`'s tracks on `to` and keep its video flowing.
fn deliver_tracks(to: &mut Side, from: Option<MediaHandle>) {
    let Some(from) = from else {
        return;
    };
    let tracks = from.tracks();
    if tracks.audio.is_some() {
        to.send(PeerEvent::RemoteTrack {
            kind: TrackKind::Audio,
            frames: None,
        });
    }
    if let Some(video) = tracks.video {
        let (feed, frames) = watch::channel::<Option<VideoFrame>>(video.snapshot());
        to.send(PeerEvent::RemoteTrack {
            kind: TrackKind::Video,
            frames: Some(frames),
        });
        to.pumps.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUMP_INTERVAL);
            loop {
                ticker.tick().await;
                if feed.is_closed() {
                    break;
                }
                if video.is_enabled() {
                    if let Some(frame) = video.snapshot() {
                        feed.send_replace(Some(frame));
                    }
                }
            }
        }));
    }
}

fn parse_id(description: &str, prefix: &str) -> Result<u64, PeerError> {
    description
        .strip_prefix(prefix)
        .and_then(|rest| rest.split(':').next())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| PeerError::MalformedDescription(description.to_string()))
}

enum ChannelLink {
    Unpaired(u64),
    Paired(u64, Position),
}

struct SimChannel {
    net: SimulatedNetwork,
    link: ChannelLink,
}

impl SimChannel {
    fn id(&self) -> u64 {
        match self.link {
            ChannelLink::Unpaired(id) | ChannelLink::Paired(id, _) => id,
        }
    }

    fn pair(&self) -> Result<(u64, Position), PeerError> {
        match self.link {
            ChannelLink::Paired(id, position) => Ok((id, position)),
            ChannelLink::Unpaired(_) => Err(PeerError::Negotiation("no description exchanged yet".into())),
        }
    }
}

impl PeerChannel for SimChannel {
    fn attach_local(&mut self, local: &MediaHandle) -> Result<(), PeerError> {
        self.net.attach_local(&self.link, local);
        Ok(())
    }

    fn create_offer(&mut self) -> Result<String, PeerError> {
        let id = self.net.offer(Flavor::Native, self.id())?;
        self.link = ChannelLink::Paired(id, Position::Offerer);
        Ok(format!("{NATIVE_OFFER}{id}"))
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<String, PeerError> {
        let pair_id = parse_id(sdp, NATIVE_OFFER)?;
        self.net.answer(Flavor::Native, self.id(), pair_id)?;
        self.link = ChannelLink::Paired(pair_id, Position::Answerer);
        Ok(format!("{NATIVE_ANSWER}{pair_id}"))
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        let (pair_id, _) = self.pair()?;
        if parse_id(sdp, NATIVE_ANSWER)? != pair_id {
            return Err(PeerError::Negotiation("answer for another offer".into()));
        }
        self.net.apply_answer(pair_id)
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), PeerError> {
        let (pair_id, position) = self.pair()?;
        if !candidate.starts_with("sim-candidate:") {
            return Err(PeerError::MalformedDescription(candidate.to_string()));
        }
        self.net.add_candidate(pair_id, position)
    }

    fn close(&mut self) {
        self.net.close(&self.link);
    }
}

impl SecondaryChannel for SimChannel {
    fn attach_local(&mut self, local: &MediaHandle) -> Result<(), PeerError> {
        self.net.attach_local(&self.link, local);
        Ok(())
    }

    fn initiate(&mut self) -> Result<String, PeerError> {
        let id = self.net.offer(Flavor::Secondary, self.id())?;
        self.link = ChannelLink::Paired(id, Position::Offerer);
        Ok(format!("{SECONDARY_INIT}{id}"))
    }

    fn respond(&mut self, remote: &str) -> Result<String, PeerError> {
        let pair_id = parse_id(remote, SECONDARY_INIT)?;
        self.net.answer(Flavor::Secondary, self.id(), pair_id)?;
        self.link = ChannelLink::Paired(pair_id, Position::Answerer);
        Ok(format!("{SECONDARY_REPLY}{pair_id}"))
    }

    fn complete(&mut self, remote: &str) -> Result<(), PeerError> {
        let (pair_id, _) = self.pair()?;
        if parse_id(remote, SECONDARY_REPLY)? != pair_id {
            return Err(PeerError::Negotiation("reply for another session".into()));
        }
        self.net.apply_answer(pair_id)
    }

    fn close(&mut self) {
        self.net.close(&self.link);
    }
}

struct NativeSim(SimulatedNetwork);

impl PeerConnector for NativeSim {
    fn open(&self, events: PeerEventSender) -> Result<Box<dyn PeerChannel>, PeerError> {
        let id = self.0.open(Flavor::Native, events)?;
        Ok(Box::new(SimChannel {
            net: self.0.clone(),
            link: ChannelLink::Unpaired(id),
        }))
    }
}

struct SecondarySim(SimulatedNetwork);

impl SecondaryConnector for SecondarySim {
    fn open(&self, events: PeerEventSender) -> Result<Box<dyn SecondaryChannel>, PeerError> {
        let id = self.0.open(Flavor::Secondary, events)?;
        Ok(Box::new(SimChannel {
            net: self.0.clone(),
            link: ChannelLink::Unpaired(id),
        }))
    }
}
