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

//! Media capability traits.
//!
//! Capture and rendering stay outside the orchestrator: the caller hands in a
//! [`MediaSource`] and a [`FrameSink`], tiers lend the source's tracks to
//! their channel and hand remote media back as a [`RemoteMedia`] handle.

use crate::diagnostics::now_ms;
use crate::state::TierKind;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One raw, tightly packed video frame.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

impl VideoFrame {
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == Self::expected_len(self.width, self.height, self.format)
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);

    /// Latest captured frame. Audio tracks, stopped tracks and tracks that
    /// have not produced anything yet return `None`.
    fn snapshot(&self) -> Option<VideoFrame> {
        None
    }
}

#[derive(Clone, Default)]
pub struct LocalTracks {
    pub audio: Option<Arc<dyn MediaTrack>>,
    pub video: Option<Arc<dyn MediaTrack>>,
}

impl LocalTracks {
    pub fn get(&self, kind: TrackKind) -> Option<&Arc<dyn MediaTrack>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.audio.is_some() {
            kinds.push(TrackKind::Audio);
        }
        if self.video.is_some() {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

/// A local capture bundle. Owned by the session once supplied and lent to
/// exactly one tier at a time.
pub trait MediaSource: Send + Sync {
    fn id(&self) -> String;
    fn tracks(&self) -> LocalTracks;
    /// Release the capture devices. Called when the source is replaced or
    /// the session ends.
    fn stop(&self);
}

pub type MediaHandle = Arc<dyn MediaSource>;

/// Remote media as produced by a tier.
///
/// Video arrives through a `watch` channel holding the most recent frame;
/// renderers read it at their own pace.
#[derive(Clone)]
pub struct RemoteMedia {
    pub id: String,
    pub tier: TierKind,
    pub kinds: Vec<TrackKind>,
    pub frames: watch::Receiver<Option<VideoFrame>>,
}

impl RemoteMedia {
    pub fn new(
        id: impl Into<String>,
        tier: TierKind,
        kinds: Vec<TrackKind>,
        frames: watch::Receiver<Option<VideoFrame>>,
    ) -> Self {
        Self {
            id: id.into(),
            tier,
            kinds,
            frames,
        }
    }

    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.frames.borrow().clone()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("kinds", &self.kinds)
            .finish()
    }
}

/// Where remote media is rendered. `bind(None)` clears the output.
///
/// Called from the session event loop; implementations must not block.
pub trait FrameSink: Send + Sync {
    fn bind(&self, remote: Option<RemoteMedia>);
}

/// Sink that renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn bind(&self, _remote: Option<RemoteMedia>) {}
}

// === Synthetic test pattern ===

struct PatternTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: Arc<AtomicBool>,
    width: u32,
    height: u32,
    seed: u8,
    frame_counter: AtomicU64,
}

impl MediaTrack for PatternTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn snapshot(&self) -> Option<VideoFrame> {
        if self.kind != TrackKind::Video || self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let n = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        let shift = (n % 256) as u8;
        let mut data = Vec::with_capacity(VideoFrame::expected_len(
            self.width,
            self.height,
            PixelFormat::Rgb24,
        ));
        for y in 0..self.height {
            for x in 0..self.width {
                let r = ((x * 255) / self.width.max(1)) as u8;
                let g = ((y * 255) / self.height.max(1)) as u8;
                data.extend_from_slice(&[r.wrapping_add(shift), g, self.seed]);
            }
        }
        Some(VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgb24,
            data,
            timestamp_ms: now_ms(),
        })
    }
}

/// Synthetic camera + microphone: a moving RGB gradient and a silent audio
/// track. Used by the CLI and by tests.
pub struct TestPatternSource {
    id: String,
    audio: Arc<PatternTrack>,
    video: Arc<PatternTrack>,
    stopped: Arc<AtomicBool>,
}

impl TestPatternSource {
    pub fn new(id: &str, width: u32, height: u32) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        // Distinct blue channel per source so tests can tell frames apart.
        let seed = id.bytes().fold(0u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
        let track = |kind: TrackKind| {
            Arc::new(PatternTrack {
                id: format!("{id}-{kind}"),
                kind,
                enabled: AtomicBool::new(true),
                stopped: stopped.clone(),
                width,
                height,
                seed,
                frame_counter: AtomicU64::new(0),
            })
        };
        Self {
            id: id.to_string(),
            audio: track(TrackKind::Audio),
            video: track(TrackKind::Video),
            stopped: stopped.clone(),
        }
    }

    pub fn shared(id: &str, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self::new(id, width, height))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Blue channel value stamped into every pixel of this source's frames.
    pub fn seed(&self) -> u8 {
        self.video.seed
    }
}

impl MediaSource for TestPatternSource {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn tracks(&self) -> LocalTracks {
        LocalTracks {
            audio: Some(self.audio.clone()),
            video: Some(self.video.clone()),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_frames_are_well_formed() {
        let source = TestPatternSource::new("cam", 32, 24);
        let video = source.tracks().video.unwrap();
        let frame = video.snapshot().unwrap();
        assert!(frame.is_well_formed());
        assert_eq!(frame.data[2], source.seed());
    }

    #[test]
    fn stopped_source_produces_nothing() {
        let source = TestPatternSource::new("cam", 8, 8);
        let video = source.tracks().video.unwrap();
        source.stop();
        assert!(source.is_stopped());
        assert!(video.snapshot().is_none());
    }

    #[test]
    fn audio_track_has_no_snapshot() {
        let source = TestPatternSource::new("mic", 8, 8);
        let audio = source.tracks().audio.unwrap();
        assert_eq!(audio.kind(), TrackKind::Audio);
        assert!(audio.snapshot().is_none());
    }

    #[test]
    fn toggling_is_visible_through_every_handle() {
        let source = TestPatternSource::new("cam", 8, 8);
        source.tracks().video.unwrap().set_enabled(false);
        assert!(!source.tracks().video.unwrap().is_enabled());
        assert_eq!(source.tracks().kinds(), vec![TrackKind::Audio, TrackKind::Video]);
    }
}
