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

use super::peer::{spawn_channel_watch, PeerChannel, PeerConnector};
use super::{emit, TierEvent, TierEventSender, TierState, TransportTier};
use crate::error::PeerError;
use crate::media::MediaHandle;
use crate::state::TierKind;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use videocall_signaling::Payload;

/// Offer/answer negotiation with an open-ended candidate stream.
///
/// Remote candidates that arrive before the remote description is applied
/// are held back and applied right after it.
pub struct NativeTier {
    connector: Arc<dyn PeerConnector>,
    local: Option<MediaHandle>,
    channel: Option<Box<dyn PeerChannel>>,
    watch: Option<JoinHandle<()>>,
    events: Option<TierEventSender>,
    is_initiator: bool,
    remote_description_set: bool,
    pending_candidates: Vec<String>,
}

impl NativeTier {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            local: None,
            channel: None,
            watch: None,
            events: None,
            is_initiator: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    fn open_channel(&mut self) -> Result<(), PeerError> {
        let (Some(local), Some(events)) = (self.local.clone(), self.events.clone()) else {
            return Err(PeerError::Closed);
        };
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let mut channel = self.connector.open(peer_tx)?;
        channel.attach_local(&local)?;
        self.watch = Some(spawn_channel_watch(TierKind::Native, true, peer_rx, events));
        self.channel = Some(channel);
        self.remote_description_set = false;
        Ok(())
    }

    fn close_channel(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.abort();
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.remote_description_set = false;
    }

    fn on_offer(&mut self, sdp: &str) -> Result<(), PeerError> {
        if self.is_initiator {
            return Err(PeerError::UnexpectedSignal("offer"));
        }
        if self.remote_description_set {
            // The initiator restarted its attempt; follow it on a fresh channel.
            info!("native tier received a new offer, restarting channel");
            self.close_channel();
            self.open_channel()?;
        }
        let channel = self.channel.as_mut().ok_or(PeerError::Closed)?;
        let answer = channel.accept_offer(sdp)?;
        self.remote_description_set = true;
        emit(&self.events, TierEvent::Signal(Payload::Answer { sdp: answer }));
        self.flush_candidates()
    }

    fn on_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        if !self.is_initiator {
            return Err(PeerError::UnexpectedSignal("answer"));
        }
        if self.remote_description_set {
            debug!("native tier ignoring duplicate answer");
            return Ok(());
        }
        let channel = self.channel.as_mut().ok_or(PeerError::Closed)?;
        channel.accept_answer(sdp)?;
        self.remote_description_set = true;
        self.flush_candidates()
    }

    fn on_candidate(&mut self, candidate: &str) -> Result<(), PeerError> {
        if !self.remote_description_set {
            self.pending_candidates.push(candidate.to_string());
            return Ok(());
        }
        let channel = self.channel.as_mut().ok_or(PeerError::Closed)?;
        channel.add_remote_candidate(candidate)
    }

    fn flush_candidates(&mut self) -> Result<(), PeerError> {
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return Ok(());
        }
        debug!("applying {} buffered candidates", pending.len());
        let channel = self.channel.as_mut().ok_or(PeerError::Closed)?;
        for candidate in pending {
            channel.add_remote_candidate(&candidate)?;
        }
        Ok(())
    }
}

impl TransportTier for NativeTier {
    fn kind(&self) -> TierKind {
        TierKind::Native
    }

    fn start(
        &mut self,
        local: MediaHandle,
        is_initiator: bool,
        events: TierEventSender,
    ) -> Result<(), PeerError> {
        self.local = Some(local);
        self.events = Some(events);
        self.is_initiator = is_initiator;
        self.open_channel()?;
        if is_initiator {
            let channel = self.channel.as_mut().ok_or(PeerError::Closed)?;
            let sdp = channel.create_offer()?;
            emit(&self.events, TierEvent::Signal(Payload::Offer { sdp }));
        }
        Ok(())
    }

    fn handle_signal(&mut self, payload: &Payload) {
        let result = match payload {
            Payload::Offer { sdp } => self.on_offer(sdp),
            Payload::Answer { sdp } => self.on_answer(sdp),
            Payload::IceCandidate { candidate } => self.on_candidate(candidate),
            other => {
                debug!("native tier ignoring {}", other.message_type());
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("native negotiation error: {e}");
            emit(&self.events, TierEvent::StateChange(TierState::Failed(e.to_string())));
        }
    }

    fn stop(&mut self) {
        self.close_channel();
        self.pending_candidates.clear();
        self.events = None;
        self.local = None;
    }
}

impl Drop for NativeTier {
    fn drop(&mut self) {
        self.stop();
    }
}
