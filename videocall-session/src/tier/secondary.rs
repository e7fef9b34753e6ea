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

use super::peer::{spawn_channel_watch, SecondaryChannel, SecondaryConnector};
use super::{emit, TierEvent, TierEventSender, TierState, TransportTier};
use crate::error::PeerError;
use crate::media::MediaHandle;
use crate::state::TierKind;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use videocall_signaling::Payload;

/// Negotiation through the secondary peer-channel library: exactly one opaque
/// blob in each direction, no incremental candidates.
pub struct SecondaryTier {
    connector: Arc<dyn SecondaryConnector>,
    local: Option<MediaHandle>,
    channel: Option<Box<dyn SecondaryChannel>>,
    watch: Option<JoinHandle<()>>,
    events: Option<TierEventSender>,
    is_initiator: bool,
    remote_blob_applied: bool,
}

impl SecondaryTier {
    pub fn new(connector: Arc<dyn SecondaryConnector>) -> Self {
        Self {
            connector,
            local: None,
            channel: None,
            watch: None,
            events: None,
            is_initiator: false,
            remote_blob_applied: false,
        }
    }

    fn open_channel(&mut self) -> Result<(), PeerError> {
        let (Some(local), Some(events)) = (self.local.clone(), self.events.clone()) else {
            return Err(PeerError::Closed);
        };
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let mut channel = self.connector.open(peer_tx)?;
        channel.attach_local(&local)?;
        self.watch = Some(spawn_channel_watch(TierKind::Secondary, false, peer_rx, events));
        self.channel = Some(channel);
        self.remote_blob_applied = false;
        Ok(())
    }

    fn close_channel(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.abort();
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.remote_blob_applied = false;
    }

    fn on_blob(&mut self, blob: &str) -> Result<(), PeerError> {
        if self.is_initiator {
            if self.remote_blob_applied {
                debug!("secondary tier ignoring extra reply blob");
                return Ok(());
            }
            let channel = self.channel.as_mut().ok_or(PeerError::Closed)?;
            channel.complete(blob)?;
            self.remote_blob_applied = true;
            return Ok(());
        }

        if self.remote_blob_applied {
            info!("secondary tier received a new initiator blob, restarting channel");
            self.close_channel();
            self.open_channel()?;
        }
        let channel = self.channel.as_mut().ok_or(PeerError::Closed)?;
        let reply = channel.respond(blob)?;
        self.remote_blob_applied = true;
        emit(
            &self.events,
            TierEvent::Signal(Payload::SecondarySignal { blob: reply }),
        );
        Ok(())
    }
}

impl TransportTier for SecondaryTier {
    fn kind(&self) -> TierKind {
        TierKind::Secondary
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
            let blob = channel.initiate()?;
            emit(&self.events, TierEvent::Signal(Payload::SecondarySignal { blob }));
        }
        Ok(())
    }

    fn handle_signal(&mut self, payload: &Payload) {
        let Payload::SecondarySignal { blob } = payload else {
            debug!("secondary tier ignoring {}", payload.message_type());
            return;
        };
        if let Err(e) = self.on_blob(blob) {
            warn!("secondary negotiation error: {e}");
            emit(&self.events, TierEvent::StateChange(TierState::Failed(e.to_string())));
        }
    }

    fn stop(&mut self) {
        self.close_channel();
        self.events = None;
        self.local = None;
    }
}

impl Drop for SecondaryTier {
    fn drop(&mut self) {
        self.stop();
    }
}
