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


//! Types for the signaling side of the videocall session orchestrator.
//!
//! The orchestrator only needs ordered, per-direction delivery of these
//! messages; the substrate (WebSocket, in-memory hub, ...) lives in
//! `videocall-transport`.

pub mod callback;
pub mod message;

pub use callback::Callback;
pub use message::{CodecError, MessageType, Payload, SignalingMessage};

/// Name used by the rendezvous service when it originates a message
/// (roster updates, heartbeat acks). Never a participant name.
pub const SERVICE_SENDER_ID: &str = "rendezvous";
