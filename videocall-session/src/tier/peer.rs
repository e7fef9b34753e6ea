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

//! Backend capabilities for the negotiated tiers, and the task that turns a
//! backend's event stream into tier events.

use super::{TierEvent, TierEventSender, TierState};
use crate::error::PeerError;
use crate::media::{MediaHandle, RemoteMedia, TrackKind, VideoFrame};
use crate::state::TierKind;
use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use videocall_signaling::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum PeerEvent {
    /// A locally gathered connectivity candidate to trickle to the peer.
    LocalCandidate(String),
    TransportState(PeerTransportState),
    RemoteTrack {
        kind: TrackKind,
        /// Decoded frames for video tracks; `None` for audio.
        frames: Option<watch::Receiver<Option<VideoFrame>>>,
    },
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// One offer/answer peer connection.
pub trait PeerChannel: Send {
    fn attach_local(&mut self, local: &MediaHandle) -> Result<(), PeerError>;
    fn create_offer(&mut self) -> Result<String, PeerError>;
    /// Apply the remote offer and produce the answer.
    fn accept_offer(&mut self, sdp: &str) -> Result<String, PeerError>;
    fn accept_answer(&mut self, sdp: &str) -> Result<(), PeerError>;
    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), PeerError>;
    fn close(&mut self);
}

pub trait PeerConnector: Send + Sync {
    /// Open a fresh channel reporting through `events`.
    fn open(&self, events: PeerEventSender) -> Result<Box<dyn PeerChannel>, PeerError>;
}

/// A channel negotiated with exactly one opaque blob per direction.
pub trait SecondaryChannel: Send {
    fn attach_local(&mut self, local: &MediaHandle) -> Result<(), PeerError>;
    /// Initiator side: produce the only outbound blob.
    fn initiate(&mut self) -> Result<String, PeerError>;
    /// Responder side: consume the initiator's blob, produce the reply.
    fn respond(&mut self, remote: &str) -> Result<String, PeerError>;
    /// Initiator side: consume the responder's reply.
    fn complete(&mut self, remote: &str) -> Result<(), PeerError>;
    fn close(&mut self);
}

pub trait SecondaryConnector: Send + Sync {
    fn open(&self, events: PeerEventSender) -> Result<Box<dyn SecondaryChannel>, PeerError>;
}

/// Stand-in for a missing peer-channel stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableConnector;

impl PeerConnector for UnavailableConnector {
    fn open(&self, _events: PeerEventSender) -> Result<Box<dyn PeerChannel>, PeerError> {
        Err(PeerError::Unavailable("no native peer-channel stack".into()))
    }
}

impl SecondaryConnector for UnavailableConnector {
    fn open(&self, _events: PeerEventSender) -> Result<Box<dyn SecondaryChannel>, PeerError> {
        Err(PeerError::Unavailable("no secondary peer-channel library".into()))
    }
}

/// Forward backend events as tier events until the channel closes.
///
/// The tier is connected once the transport is up *and* at least one remote
/// track has arrived; remote media is always announced before the connected
/// state. A transport failure after that is reported as a failure too, which
/// the session reads as carrier loss.
pub(super) fn spawn_channel_watch(
    tier: TierKind,
    trickle: bool,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    events: TierEventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut transport_up = false;
        let mut connected = false;
        let mut kinds: Vec<TrackKind> = Vec::new();
        let mut frames: Option<watch::Receiver<Option<VideoFrame>>> = None;
        let mut media_id = String::new();

        while let Some(event) = peer_events.recv().await {
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    if !trickle {
                        debug!("{tier} tier ignoring local candidate");
                        continue;
                    }
                    let _ = events.send(TierEvent::Signal(Payload::IceCandidate { candidate }));
                }
                PeerEvent::TransportState(PeerTransportState::Connected) => transport_up = true,
                PeerEvent::TransportState(
                    state @ (PeerTransportState::Disconnected
                    | PeerTransportState::Failed
                    | PeerTransportState::Closed),
                ) => {
                    warn!("{tier} transport went {state:?}");
                    let _ = events.send(TierEvent::StateChange(TierState::Failed(format!(
                        "{tier} transport {state:?}"
                    ))));
                    break;
                }
                PeerEvent::TransportState(state) => debug!("{tier} transport {state:?}"),
                PeerEvent::RemoteTrack {
                    kind,
                    frames: track_frames,
                } => {
                    if kinds.contains(&kind) {
                        continue;
                    }
                    kinds.push(kind);
                    if frames.is_none() {
                        frames = track_frames;
                    }
                    if media_id.is_empty() {
                        media_id = format!("{tier}-remote-{}", crate::diagnostics::now_ms());
                    }
                    let receiver = frames.clone().unwrap_or_else(|| watch::channel(None).1);
                    let media = RemoteMedia::new(media_id.clone(), tier, kinds.clone(), receiver);
                    let _ = events.send(TierEvent::RemoteMedia(media));
                }
            }
            if transport_up && !kinds.is_empty() && !connected {
                connected = true;
                let _ = events.send(TierEvent::StateChange(TierState::Connected));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connected_needs_transport_and_track() {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch = spawn_channel_watch(TierKind::Native, true, peer_rx, tx);

        peer_tx
            .send(PeerEvent::TransportState(PeerTransportState::Connected))
            .unwrap();
        peer_tx
            .send(PeerEvent::LocalCandidate("host 1".into()))
            .unwrap();
        let (_frames_tx, frames_rx) = watch::channel(None);
        peer_tx
            .send(PeerEvent::RemoteTrack {
                kind: TrackKind::Video,
                frames: Some(frames_rx),
            })
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(TierEvent::Signal(Payload::IceCandidate { .. }))
        ));
        match rx.recv().await {
            Some(TierEvent::RemoteMedia(media)) => {
                assert_eq!(media.tier, TierKind::Native);
                assert!(media.has(TrackKind::Video));
            }
            other => panic!("expected remote media, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(TierEvent::StateChange(TierState::Connected))
        ));
        watch.abort();
    }

    #[tokio::test]
    async fn transport_without_tracks_never_connects() {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watch = spawn_channel_watch(TierKind::Secondary, false, peer_rx, tx);

        peer_tx
            .send(PeerEvent::TransportState(PeerTransportState::Connected))
            .unwrap();
        peer_tx
            .send(PeerEvent::LocalCandidate("ignored".into()))
            .unwrap();
        peer_tx
            .send(PeerEvent::TransportState(PeerTransportState::Failed))
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(TierEvent::StateChange(TierState::Failed(_)))
        ));
        assert!(rx.recv().await.is_none());
    }
}
