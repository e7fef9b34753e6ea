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

//! Events published on a session's event bus.
//!
//! These complement the status snapshot: the snapshot says where the session
//! is, events say what just happened.

use crate::media::TrackKind;
use crate::state::{Role, SessionState, TierKind};

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },

    // === Roster ===
    PeerJoined(String),
    PeerLeft(String),
    /// A negotiation partner was chosen for a new cycle.
    PeerSelected {
        peer: String,
        role: Role,
    },

    // === Tiers ===
    TierAttemptStarted(TierKind),
    TierDegraded {
        from: TierKind,
        to: TierKind,
        reason: String,
    },
    RemoteMediaBound(TierKind),
    RemoteMediaCleared,

    // === Local media ===
    LocalTrackToggled {
        kind: TrackKind,
        enabled: bool,
    },

    // === Link health ===
    /// Heartbeats sent without a matching ack, past the configured grace.
    HeartbeatMissed {
        outstanding: u64,
    },
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
    },
}
