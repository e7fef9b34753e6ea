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

use super::{emit, TierEvent, TierEventSender, TierState, TransportTier};
use crate::error::PeerError;
use crate::media::{MediaHandle, RemoteMedia, TrackKind, VideoFrame};
use crate::relay_codec::RelayFrameCodec;
use crate::state::TierKind;
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use videocall_signaling::Payload;

/// Last-resort tier: media travels through the signaling service itself as
/// periodic still frames. Needs nothing from the peer but the same room, so
/// it is connected as soon as it starts.
pub struct RelayTier {
    room_id: String,
    codec: RelayFrameCodec,
    frame_interval: Duration,
    sampler: Option<JoinHandle<()>>,
    events: Option<TierEventSender>,
    feed: Option<watch::Sender<Option<VideoFrame>>>,
    frames_received: u64,
}

impl RelayTier {
    pub fn new(room_id: &str, codec: RelayFrameCodec, frame_interval: Duration) -> Self {
        Self {
            room_id: room_id.to_string(),
            codec,
            frame_interval,
            sampler: None,
            events: None,
            feed: None,
            frames_received: 0,
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    fn on_frame(&mut self, blob: &str) {
        let decoded = match self.codec.decode(blob) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("dropping undecodable relay frame: {e}");
                return;
            }
        };
        self.frames_received += 1;
        match &self.feed {
            Some(feed) => {
                feed.send_replace(Some(decoded.frame));
            }
            None => {
                let (feed, frames) = watch::channel(Some(decoded.frame));
                let media = RemoteMedia::new(
                    format!("relay-{}", self.room_id),
                    TierKind::Relay,
                    vec![TrackKind::Video],
                    frames,
                );
                self.feed = Some(feed);
                emit(&self.events, TierEvent::RemoteMedia(media));
            }
        }
    }
}

impl TransportTier for RelayTier {
    fn kind(&self) -> TierKind {
        TierKind::Relay
    }

    fn start(
        &mut self,
        local: MediaHandle,
        _is_initiator: bool,
        events: TierEventSender,
    ) -> Result<(), PeerError> {
        self.events = Some(events.clone());
        emit(&self.events, TierEvent::StateChange(TierState::Connected));

        let codec = self.codec;
        let room_id = self.room_id.clone();
        let interval = self.frame_interval;
        self.sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(video) = local.tracks().video else {
                    continue;
                };
                if !video.is_enabled() {
                    continue;
                }
                let Some(frame) = video.snapshot() else {
                    continue;
                };
                let timestamp = frame.timestamp_ms;
                let blob = match codec.encode(&frame) {
                    Ok(blob) => blob,
                    Err(e) => {
                        warn!("relay encode failed: {e}");
                        continue;
                    }
                };
                trace!("relay frame {} bytes", blob.len());
                let signal = Payload::RelayFrame {
                    room_id: room_id.clone(),
                    blob,
                    timestamp,
                };
                if events.send(TierEvent::Signal(signal)).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn handle_signal(&mut self, payload: &Payload) {
        match payload {
            Payload::RelayFrame { blob, .. } => self.on_frame(blob),
            other => debug!("relay tier ignoring {}", other.message_type()),
        }
    }

    fn stop(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        self.feed = None;
        self.events = None;
    }
}

impl Drop for RelayTier {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaSource, TestPatternSource};
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn connects_immediately_and_samples_enabled_video() {
        let source = TestPatternSource::shared("cam", 32, 24);
        let mut tier = RelayTier::new("room", RelayFrameCodec::default(), Duration::from_millis(250));
        let (tx, mut rx) = mpsc::unbounded_channel();
        tier.start(source.clone(), true, tx).unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(TierEvent::StateChange(TierState::Connected))
        ));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let mut frames = 0;
        while let Ok(event) = rx.try_recv() {
            if let TierEvent::Signal(Payload::RelayFrame { room_id, .. }) = event {
                assert_eq!(room_id, "room");
                frames += 1;
            }
        }
        assert!(frames >= 2);

        source.tracks().video.unwrap().set_enabled(false);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err());
        tier.stop();
    }

    #[tokio::test]
    async fn inbound_frames_bind_once_then_update() {
        let codec = RelayFrameCodec::default();
        let source = TestPatternSource::new("peer", 16, 16);
        let frame = source.tracks().video.unwrap().snapshot().unwrap();
        let blob = codec.encode(&frame).unwrap();

        let mut tier = RelayTier::new("room", codec, Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        tier.start(TestPatternSource::shared("me", 8, 8), false, tx).unwrap();
        let _connected = rx.try_recv();

        let signal = Payload::RelayFrame {
            room_id: "room".into(),
            blob,
            timestamp: frame.timestamp_ms,
        };
        tier.handle_signal(&signal);
        tier.handle_signal(&signal);

        let media = match rx.try_recv() {
            Ok(TierEvent::RemoteMedia(media)) => media,
            other => panic!("expected remote media, got {other:?}"),
        };
        assert_eq!(media.tier, TierKind::Relay);
        assert_eq!(media.latest_frame().map(|f| (f.width, f.height)), Some((16, 16)));
        assert!(!matches!(rx.try_recv(), Ok(TierEvent::RemoteMedia(_))));
        assert_eq!(tier.frames_received(), 2);

        tier.handle_signal(&Payload::RelayFrame {
            room_id: "room".into(),
            blob: "garbage".into(),
            timestamp: 0,
        });
        assert_eq!(tier.frames_received(), 2);
    }
}
