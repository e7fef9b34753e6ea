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

//! Transport tiers.
//!
//! A tier turns the local media plus a stream of signaling payloads into a
//! connected media path. The session runs at most one tier at a time and walks
//! them in [`TierKind`] order until one reports [`TierState::Connected`].
//!
//! Tiers report back through the [`TierEventSender`] handed to `start`. The
//! session owns the receiving end and drops it on `stop`, so nothing a
//! stopped tier emits is ever observed.

mod native;
mod peer;
mod relay;
mod secondary;

pub use native::NativeTier;
pub use peer::{
    PeerChannel, PeerConnector, PeerEvent, PeerEventSender, PeerTransportState, SecondaryChannel,
    SecondaryConnector, UnavailableConnector,
};
pub use relay::RelayTier;
pub use secondary::SecondaryTier;

use crate::error::PeerError;
use crate::media::{MediaHandle, RemoteMedia};
use crate::state::TierKind;
use std::sync::Arc;
use tokio::sync::mpsc;
use videocall_signaling::Payload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierState {
    Connected,
    Failed(String),
}

#[derive(Debug)]
pub enum TierEvent {
    /// Outbound signaling for the peer.
    Signal(Payload),
    RemoteMedia(RemoteMedia),
    StateChange(TierState),
}

pub type TierEventSender = mpsc::UnboundedSender<TierEvent>;

pub trait TransportTier: Send {
    fn kind(&self) -> TierKind;

    /// Begin negotiating with `local` lent to the tier. An `Err` means the
    /// tier could not even start and counts as an immediate failure.
    fn start(
        &mut self,
        local: MediaHandle,
        is_initiator: bool,
        events: TierEventSender,
    ) -> Result<(), PeerError>;

    /// Inbound signaling addressed to this tier.
    fn handle_signal(&mut self, payload: &Payload);

    /// Release everything. Synchronous and idempotent.
    fn stop(&mut self);
}

/// The tier an inbound peer payload belongs to.
pub fn tier_for_payload(payload: &Payload) -> Option<TierKind> {
    match payload {
        Payload::Offer { .. } | Payload::Answer { .. } | Payload::IceCandidate { .. } => {
            Some(TierKind::Native)
        }
        Payload::SecondarySignal { .. } => Some(TierKind::Secondary),
        Payload::RelayFrame { .. } => Some(TierKind::Relay),
        _ => None,
    }
}

/// Peer-channel backends for the two negotiated tiers. The relay tier needs
/// nothing beyond the signaling link.
#[derive(Clone)]
pub struct TierBackends {
    pub native: Arc<dyn PeerConnector>,
    pub secondary: Arc<dyn SecondaryConnector>,
}

impl TierBackends {
    pub fn new(native: Arc<dyn PeerConnector>, secondary: Arc<dyn SecondaryConnector>) -> Self {
        Self { native, secondary }
    }

    /// No peer-channel stack available: both negotiated tiers fail at start
    /// and every session lands on the relay tier.
    pub fn relay_only() -> Self {
        let unavailable = Arc::new(UnavailableConnector);
        Self {
            native: unavailable.clone(),
            secondary: unavailable,
        }
    }
}

pub(crate) fn emit(events: &Option<TierEventSender>, event: TierEvent) {
    if let Some(events) = events {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_map_to_their_tier() {
        assert_eq!(
            tier_for_payload(&Payload::IceCandidate {
                candidate: "c".into()
            }),
            Some(TierKind::Native)
        );
        assert_eq!(
            tier_for_payload(&Payload::SecondarySignal { blob: "b".into() }),
            Some(TierKind::Secondary)
        );
        assert_eq!(tier_for_payload(&Payload::Heartbeat), None);
    }
}
