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

//! Per-session event bus.
//!
//! MPMC broadcast of [`SessionEvent`]s. Every subscriber gets every event
//! emitted after it subscribed; a slow subscriber loses the oldest events
//! rather than stalling the session.
//!
//! ```ignore
//! let mut rx = session.events();
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         if let SessionEvent::TierDegraded { from, to, .. } = event {
//!             println!("fell back from {from} to {to}");
//!         }
//!     }
//! });
//! ```

use crate::events::SessionEvent;
use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct SessionEventBus {
    sender: Sender<SessionEvent>,
    // Keeps the channel open while nobody is subscribed.
    _keepalive: InactiveReceiver<SessionEvent>,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventBus {
    pub fn new() -> Self {
        let (mut sender, receiver) = broadcast(EVENT_BUS_CAPACITY);
        sender.set_overflow(true);
        sender.set_await_active(false);
        Self {
            sender,
            _keepalive: receiver.deactivate(),
        }
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.sender.new_receiver()
    }

    /// Non-blocking. Events emitted with no active subscriber are dropped.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.try_broadcast(event);
    }
}
