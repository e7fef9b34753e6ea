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


//! Signaling envelope exchanged with the rendezvous service.
//!
//! Every message carries the room it belongs to and the connection id the
//! service stamped on it (`sender_id`). Clients leave `sender_id` empty; the
//! service fills it in before fanning the message out to the room.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure to turn a frame from the wire into a [`SignalingMessage`] or back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Discriminant of a [`Payload`], handy for logging and routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    JoinRoom,
    RosterChanged,
    Offer,
    Answer,
    IceCandidate,
    SecondarySignal,
    RelayFrame,
    Renegotiate,
    Heartbeat,
    HeartbeatAck,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageType::JoinRoom => write!(f, "JOIN_ROOM"),
            MessageType::RosterChanged => write!(f, "ROSTER_CHANGED"),
            MessageType::Offer => write!(f, "OFFER"),
            MessageType::Answer => write!(f, "ANSWER"),
            MessageType::IceCandidate => write!(f, "ICE_CANDIDATE"),
            MessageType::SecondarySignal => write!(f, "SECONDARY_SIGNAL"),
            MessageType::RelayFrame => write!(f, "RELAY_FRAME"),
            MessageType::Renegotiate => write!(f, "RENEGOTIATE"),
            MessageType::Heartbeat => write!(f, "HEARTBEAT"),
            MessageType::HeartbeatAck => write!(f, "HEARTBEAT_ACK"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    /// Client → service: add `name` to the roster of `room_id`.
    JoinRoom { room_id: String, name: String },
    /// Service → clients: the full, authoritative roster of the room.
    RosterChanged { participants: Vec<String> },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
    /// One opaque blob per direction for the secondary peer-channel library.
    SecondarySignal { blob: String },
    /// A relay-tier media sample. `blob` is base64 text, `timestamp` is ms
    /// since the Unix epoch at capture.
    RelayFrame {
        room_id: String,
        blob: String,
        timestamp: u64,
    },
    /// The sender abandoned its media path and starts over from the top tier;
    /// the receiver drops its own attempt and follows.
    Renegotiate,
    Heartbeat,
    HeartbeatAck,
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::JoinRoom { .. } => MessageType::JoinRoom,
            Payload::RosterChanged { .. } => MessageType::RosterChanged,
            Payload::Offer { .. } => MessageType::Offer,
            Payload::Answer { .. } => MessageType::Answer,
            Payload::IceCandidate { .. } => MessageType::IceCandidate,
            Payload::SecondarySignal { .. } => MessageType::SecondarySignal,
            Payload::RelayFrame { .. } => MessageType::RelayFrame,
            Payload::Renegotiate => MessageType::Renegotiate,
            Payload::Heartbeat => MessageType::Heartbeat,
            Payload::HeartbeatAck => MessageType::HeartbeatAck,
        }
    }

    /// Messages that peers exchange through the room, as opposed to
    /// client/service control traffic.
    pub fn is_peer_traffic(&self) -> bool {
        matches!(
            self,
            Payload::Offer { .. }
                | Payload::Answer { .. }
                | Payload::IceCandidate { .. }
                | Payload::SecondarySignal { .. }
                | Payload::RelayFrame { .. }
                | Payload::Renegotiate
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub room_id: String,
    #[serde(default)]
    pub sender_id: String,
    pub payload: Payload,
}

impl SignalingMessage {
    /// Outbound message; the service assigns `sender_id`.
    pub fn new(room_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            room_id: room_id.into(),
            sender_id: String::new(),
            payload,
        }
    }

    pub fn join(room_id: &str, name: &str) -> Self {
        Self::new(
            room_id,
            Payload::JoinRoom {
                room_id: room_id.to_string(),
                name: name.to_string(),
            },
        )
    }

    pub fn heartbeat(room_id: &str) -> Self {
        Self::new(room_id, Payload::Heartbeat)
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Encode for a text frame.
    pub fn to_text(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a text frame.
    pub fn from_text(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl TryFrom<&[u8]> for SignalingMessage {
    type Error = CodecError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_is_tagged() {
        let msg = SignalingMessage::new("r1", Payload::Offer { sdp: "v=0".into() });
        let text = msg.to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["room_id"], "r1");
        assert_eq!(value["payload"]["type"], "Offer");
        assert_eq!(value["payload"]["data"]["sdp"], "v=0");
    }

    #[test]
    fn test_sender_id_defaults_when_absent() {
        let text = r#"{"room_id":"r1","payload":{"type":"Heartbeat"}}"#;
        let msg = SignalingMessage::from_text(text).unwrap();
        assert_eq!(msg.sender_id, "");
        assert_eq!(msg.message_type(), MessageType::Heartbeat);
    }

    #[test]
    fn test_roster_from_service() {
        let text = r#"{"room_id":"r1","sender_id":"svc","payload":{"type":"RosterChanged","data":{"participants":["bob","alice"]}}}"#;
        let msg = SignalingMessage::try_from(text.as_bytes()).unwrap();
        match msg.payload {
            Payload::RosterChanged { participants } => {
                assert_eq!(participants, vec!["bob".to_string(), "alice".to_string()])
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        let err = SignalingMessage::from_text(r#"{"room_id":"r1","payload":{"type":"Nope"}}"#)
            .unwrap_err();
        assert!(format!("{err}").contains("malformed"));
    }

    #[test]
    fn test_peer_traffic_classification() {
        assert!(Payload::IceCandidate {
            candidate: "c".into()
        }
        .is_peer_traffic());
        assert!(!Payload::Heartbeat.is_peer_traffic());
        assert!(Payload::Renegotiate.is_peer_traffic());
        assert!(!Payload::RosterChanged {
            participants: vec![]
        }
        .is_peer_traffic());
        assert_eq!(MessageType::RelayFrame.to_string(), "RELAY_FRAME");
    }
}
