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

//! Signaling links for the videocall session orchestrator.
//!
//! A [`SignalingLink`] is one ordered, bidirectional connection to the
//! rendezvous service. Two substrates are provided:
//!
//! - **`native_websocket`**: JSON text frames over `tokio-tungstenite`
//!   (enabled by the default `native` feature)
//! - **`loopback`**: an in-process rendezvous hub used by tests, demos and
//!   single-process deployments

pub mod link;
pub mod loopback;

#[cfg(feature = "native")]
pub mod native_websocket;

pub use link::{DisconnectHandler, LinkError, LinkFactory, LinkTimeouts, MessageHandler, SignalingLink};
pub use loopback::{LoopbackHub, LoopbackLink, LOOPBACK_SCHEME};
