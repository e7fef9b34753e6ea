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

//! Session state, tier identity and the status snapshot handed to observers.

use crate::error::ErrorClass;
use std::fmt;

/// Transport tiers in order of preference. The derived ordering is the
/// degradation order: `Native < Secondary < Relay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TierKind {
    Native,
    Secondary,
    Relay,
}

impl TierKind {
    pub const ALL: [TierKind; 3] = [TierKind::Native, TierKind::Secondary, TierKind::Relay];

    /// The tier tried after this one fails, if any.
    pub fn next(self) -> Option<TierKind> {
        match self {
            TierKind::Native => Some(TierKind::Secondary),
            TierKind::Secondary => Some(TierKind::Relay),
            TierKind::Relay => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::Native => "native",
            TierKind::Secondary => "secondary",
            TierKind::Relay => "relay",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    /// Joined, heartbeat running, waiting for the caller to supply media.
    AwaitingMedia,
    /// Media supplied, waiting for someone to talk to.
    MediaActive,
    Negotiating(TierKind),
    Connected(TierKind),
    /// Signaling lost; the reconnection policy decides what happens next.
    Disconnected,
    Ended,
    Error { class: ErrorClass, reason: String },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Joining => "joining",
            SessionState::AwaitingMedia => "awaiting_media",
            SessionState::MediaActive => "media_active",
            SessionState::Negotiating(_) => "negotiating",
            SessionState::Connected(_) => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Ended => "ended",
            SessionState::Error { .. } => "error",
        }
    }

    pub fn tier(&self) -> Option<TierKind> {
        match self {
            SessionState::Negotiating(tier) | SessionState::Connected(tier) => Some(*tier),
            _ => None,
        }
    }

    /// `Ended` and `Error` accept no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Error { .. })
    }

    /// States in which the session holds a live room membership.
    pub fn is_joined(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingMedia
                | SessionState::MediaActive
                | SessionState::Negotiating(_)
                | SessionState::Connected(_)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Negotiating(tier) => write!(f, "negotiating({tier})"),
            SessionState::Connected(tier) => write!(f, "connected({tier})"),
            SessionState::Error { class, reason } => write!(f, "error({class}: {reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Which side of the offer/answer exchange this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        self == Role::Initiator
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Connected,
    Failed(String),
    /// Stopped before an outcome: peer left, media replaced, link lost.
    Aborted,
}

/// One tier attempt inside a negotiation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportAttempt {
    pub tier: TierKind,
    pub started_at_ms: u64,
    pub outcome: AttemptOutcome,
}

/// Snapshot published to observers on every status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub room_id: Option<String>,
    pub local_name: Option<String>,
    pub participants: Vec<String>,
    pub peer: Option<String>,
    pub role: Option<Role>,
    pub heartbeat_active: bool,
    pub pending_timers: usize,
    pub reconnect_attempt: u32,
    pub remote_media_bound: bool,
    /// Attempts of the current negotiation cycle, oldest first.
    pub attempts: Vec<TransportAttempt>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            room_id: None,
            local_name: None,
            participants: Vec::new(),
            peer: None,
            role: None,
            heartbeat_active: false,
            pending_timers: 0,
            reconnect_attempt: 0,
            remote_media_bound: false,
            attempts: Vec::new(),
        }
    }
}

impl SessionStatus {
    pub fn active_tier(&self) -> Option<TierKind> {
        self.state.tier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_degrade_in_order() {
        assert_eq!(TierKind::Native.next(), Some(TierKind::Secondary));
        assert_eq!(TierKind::Secondary.next(), Some(TierKind::Relay));
        assert_eq!(TierKind::Relay.next(), None);
        assert!(TierKind::Native < TierKind::Relay);
    }

    #[test]
    fn display_includes_tier() {
        assert_eq!(
            SessionState::Negotiating(TierKind::Secondary).to_string(),
            "negotiating(secondary)"
        );
        let err = SessionState::Error {
            class: ErrorClass::TerminalCapability,
            reason: "no route".into(),
        };
        assert_eq!(err.to_string(), "error(terminal_capability: no route)");
        assert!(err.is_terminal());
    }
}
