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

//! Connection establishment for videocall.rs call sessions.
//!
//! A session joins a named room through the rendezvous service, picks a
//! partner, and walks the transport tiers until media flows:
//!
//! - **Native**: offer/answer peer channel with trickled candidates
//! - **Secondary**: a one-blob-per-direction peer channel
//! - **Relay**: still frames pushed through the signaling service itself
//!
//! Tiers only ever degrade within a negotiation cycle. A lost carrier or a
//! lost signaling link sends the session through `Disconnected` and a fresh
//! join, paced by a [`ReconnectionPolicy`].
//!
//! ```ignore
//! let hub = LoopbackHub::new();
//! let session = SessionHandle::spawn(
//!     SessionConfig::with_urls([hub.url()]),
//!     Arc::new(hub.clone()),
//!     TierBackends::relay_only(),
//!     Arc::new(NullSink),
//! )?;
//! session.join_room("standup", "alice").await?;
//! session.supply_local_media(TestPatternSource::shared("cam", 320, 240)).await?;
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod heartbeat;
pub mod media;
pub mod reconnect;
pub mod relay_codec;
pub mod session;
pub mod sim;
pub mod state;
pub mod tier;

pub use config::{BackoffStrategy, ReconnectConfig, SessionConfig};
pub use diagnostics::{DiagEvent, DiagnosticsReporter, Metric, MetricValue};
pub use error::{ConfigError, ErrorClass, PeerError, RelayCodecError, SessionError};
pub use event_bus::SessionEventBus;
pub use events::SessionEvent;
pub use heartbeat::HeartbeatMonitor;
pub use media::{
    FrameSink, LocalTracks, MediaHandle, MediaSource, MediaTrack, NullSink, PixelFormat,
    RemoteMedia, TestPatternSource, TrackKind, VideoFrame,
};
pub use reconnect::{ExponentialBackoff, LinearBackoff, ReconnectionPolicy};
pub use relay_codec::{DecodedRelayFrame, RelayFrameCodec};
pub use session::SessionHandle;
pub use sim::{SimBehavior, SimulatedNetwork};
pub use state::{
    AttemptOutcome, Role, SessionState, SessionStatus, TierKind, TransportAttempt,
};
pub use tier::{TierBackends, TransportTier};
