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


//! The `SignalingLink` contract shared by every signaling substrate.
//!
//! A link is one logical connection to the rendezvous service. It is
//! connected at most once; reconnection is done by creating a fresh link
//! through a [`LinkFactory`], never by the link itself.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use videocall_signaling::{Callback, SignalingMessage};

/// Handler for inbound messages. Invoked on the link's delivery task.
pub type MessageHandler = Callback<SignalingMessage>;

/// Handler for loss of an established link, with a human-readable reason.
pub type DisconnectHandler = Callback<String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("no candidate URLs supplied")]
    NoCandidates,
    #[error("{url} is not a usable signaling URL: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("reachability probe of {url} failed: {reason}")]
    ProbeFailed { url: String, reason: String },
    #[error("handshake with {url} timed out after {timeout_ms}ms")]
    HandshakeTimeout { url: String, timeout_ms: u64 },
    #[error("handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },
    #[error("all {} candidate URLs failed", .0.len())]
    AllCandidatesFailed(Vec<LinkError>),
    #[error("link is not connected")]
    NotConnected,
    #[error("link is already connected")]
    AlreadyConnected,
    #[error("could not encode signaling message: {0}")]
    Encode(String),
}

/// Per-URL budgets applied by [`SignalingLink::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    /// Budget for the lightweight reachability probe.
    pub probe: Duration,
    /// Budget for the real handshake once the probe succeeded.
    pub handshake: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_millis(1500),
            handshake: Duration::from_secs(5),
        }
    }
}

#[async_trait]
pub trait SignalingLink: Send + Sync {
    /// Try each candidate URL in order; resolve with the URL that completed
    /// its handshake, or [`LinkError::AllCandidatesFailed`].
    async fn connect(&self, candidate_urls: &[String]) -> Result<String, LinkError>;

    /// Non-blocking, best-effort enqueue. Fails fast when not connected.
    fn send(&self, msg: SignalingMessage) -> Result<(), LinkError>;

    fn on_message(&self, handler: MessageHandler);

    /// Reported at most once per link, and only after a successful connect.
    fn on_disconnected(&self, handler: DisconnectHandler);

    /// Replace both handlers with no-ops. Returns only once no handler
    /// invocation is in flight.
    fn clear_handlers(&self);

    /// Release the transport. Idempotent; never reports a disconnect.
    fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Creates fresh, unconnected links. The orchestrator calls this once per
/// (re)connection.
pub trait LinkFactory: Send + Sync {
    fn create(&self) -> Arc<dyn SignalingLink>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handler slots shared by link implementations.
///
/// Handlers are emitted while the slot lock is held, so `clear` doubles as a
/// barrier: once it returns nothing registered before it can still run.
/// Handlers must therefore not call back into the link's handler API.
#[derive(Default)]
pub(crate) struct LinkHandlers {
    on_message: Mutex<MessageHandler>,
    on_disconnected: Mutex<DisconnectHandler>,
    disconnect_reported: AtomicBool,
}

impl LinkHandlers {
    pub fn set_on_message(&self, handler: MessageHandler) {
        *lock(&self.on_message) = handler;
    }

    pub fn set_on_disconnected(&self, handler: DisconnectHandler) {
        *lock(&self.on_disconnected) = handler;
    }

    pub fn deliver(&self, msg: SignalingMessage) {
        let handler = lock(&self.on_message);
        handler.emit(msg);
    }

    pub fn report_disconnect(&self, reason: String) {
        if self.disconnect_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = lock(&self.on_disconnected);
        handler.emit(reason);
    }

    /// Suppress any later disconnect report (used by a deliberate close).
    pub fn silence_disconnect(&self) {
        self.disconnect_reported.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        *lock(&self.on_message) = Callback::noop();
        *lock(&self.on_disconnected) = Callback::noop();
    }
}
