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


//! In-process rendezvous service.
//!
//! [`LoopbackHub`] plays the role of the signaling server and its room
//! directory: it assigns connection ids, keeps each room's roster, fans peer
//! traffic out to the other members of a room and acknowledges heartbeats.
//! Every attached [`LoopbackLink`] gets its own delivery task, so messages
//! reach handlers asynchronously and in send order, like a real socket.
//!
//! The hub also exposes fault injection (unreachable service, refused
//! connects, forced drops, phantom participants) for tests and demos.

use crate::link::{
    lock, DisconnectHandler, LinkError, LinkFactory, LinkHandlers, MessageHandler, SignalingLink,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use videocall_signaling::{MessageType, Payload, SignalingMessage, SERVICE_SENDER_ID};

/// URL scheme understood by [`LoopbackLink`].
pub const LOOPBACK_SCHEME: &str = "loopback://";

const PHANTOM_PREFIX: &str = "phantom:";

enum Delivery {
    Message(SignalingMessage),
    Disconnect(String),
}

struct Attachment {
    url: String,
    room: Option<String>,
    name: Option<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct HubState {
    next_conn: u64,
    reachable: bool,
    refuse_remaining: u32,
    ack_heartbeats: bool,
    attachments: HashMap<String, Attachment>,
    /// room id -> (connection id, participant name), in join order.
    rooms: HashMap<String, Vec<(String, String)>>,
    counters: HashMap<(String, MessageType), usize>,
}

impl Default for HubState {
    fn default() -> Self {
        Self {
            next_conn: 0,
            reachable: true,
            refuse_remaining: 0,
            ack_heartbeats: true,
            attachments: HashMap::new(),
            rooms: HashMap::new(),
            counters: HashMap::new(),
        }
    }
}

impl HubState {
    fn roster(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|members| members.iter().map(|(_, name)| name.clone()).collect())
            .unwrap_or_default()
    }

    fn broadcast_roster(&self, room: &str) {
        let participants = self.roster(room);
        debug!("Room {room} roster is now {participants:?}");
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        for (conn_id, _) in members {
            if let Some(attachment) = self.attachments.get(conn_id) {
                let msg = SignalingMessage {
                    room_id: room.to_string(),
                    sender_id: SERVICE_SENDER_ID.to_string(),
                    payload: Payload::RosterChanged {
                        participants: participants.clone(),
                    },
                };
                let _ = attachment.tx.send(Delivery::Message(msg));
            }
        }
    }

    /// Remove `conn_id` from its room and tell the remaining members.
    fn leave_room(&mut self, conn_id: &str) {
        let room = self
            .attachments
            .get(conn_id)
            .and_then(|a| a.room.clone())
            .or_else(|| {
                self.rooms
                    .iter()
                    .find(|(_, members)| members.iter().any(|(c, _)| c == conn_id))
                    .map(|(room, _)| room.clone())
            });
        let Some(room) = room else {
            return;
        };
        if let Some(members) = self.rooms.get_mut(&room) {
            members.retain(|(c, _)| c != conn_id);
        }
        self.broadcast_roster(&room);
    }

    fn detach(&mut self, conn_id: &str) -> Option<Attachment> {
        self.leave_room(conn_id);
        self.attachments.remove(conn_id)
    }

    fn route(&mut self, conn_id: &str, mut msg: SignalingMessage) {
        msg.sender_id = conn_id.to_string();
        let name = match &msg.payload {
            Payload::JoinRoom { name, .. } => name.clone(),
            _ => self
                .attachments
                .get(conn_id)
                .and_then(|a| a.name.clone())
                .unwrap_or_default(),
        };
        *self
            .counters
            .entry((name.clone(), msg.message_type()))
            .or_insert(0) += 1;

        match &msg.payload {
            Payload::JoinRoom { room_id, name } => {
                let previous_room = self.attachments.get(conn_id).and_then(|a| a.room.clone());
                if previous_room.as_deref().is_some_and(|r| r != room_id) {
                    self.leave_room(conn_id);
                }
                if let Some(attachment) = self.attachments.get_mut(conn_id) {
                    attachment.room = Some(room_id.clone());
                    attachment.name = Some(name.clone());
                }
                let members = self.rooms.entry(room_id.clone()).or_default();
                if !members.iter().any(|(c, _)| c == conn_id) {
                    members.push((conn_id.to_string(), name.clone()));
                }
                info!("{name} joined room {room_id} via {conn_id}");
                self.broadcast_roster(room_id);
            }
            Payload::Heartbeat => {
                if !self.ack_heartbeats {
                    return;
                }
                if let Some(attachment) = self.attachments.get(conn_id) {
                    let ack = SignalingMessage {
                        room_id: msg.room_id.clone(),
                        sender_id: SERVICE_SENDER_ID.to_string(),
                        payload: Payload::HeartbeatAck,
                    };
                    let _ = attachment.tx.send(Delivery::Message(ack));
                }
            }
            payload if payload.is_peer_traffic() => {
                let Some(members) = self.rooms.get(&msg.room_id) else {
                    warn!("{conn_id} sent {} to unknown room {}", msg.message_type(), msg.room_id);
                    return;
                };
                if !members.iter().any(|(c, _)| c == conn_id) {
                    warn!("{conn_id} is not a member of {}", msg.room_id);
                    return;
                }
                for (other, _) in members.iter().filter(|(c, _)| c != conn_id) {
                    if let Some(attachment) = self.attachments.get(other) {
                        let _ = attachment.tx.send(Delivery::Message(msg.clone()));
                    }
                }
            }
            _ => debug!("Ignoring {} from client {conn_id}", msg.message_type()),
        }
    }
}

/// Shared in-memory signaling service. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("LoopbackHub")
            .field("attachments", &state.attachments.len())
            .field("rooms", &state.rooms.len())
            .finish()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// URL that [`LoopbackLink`]s attached to this hub accept.
    pub fn url(&self) -> String {
        format!("{LOOPBACK_SCHEME}hub")
    }

    /// While unreachable, every probe fails and nothing new can attach.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Refuse the next `count` attach attempts, then accept again.
    pub fn refuse_next_connects(&self, count: u32) {
        lock(&self.state).refuse_remaining = count;
    }

    pub fn set_heartbeat_acks(&self, enabled: bool) {
        lock(&self.state).ack_heartbeats = enabled;
    }

    /// Current roster of `room`, in join order.
    pub fn roster(&self, room: &str) -> Vec<String> {
        lock(&self.state).roster(room)
    }

    /// How many messages of `kind` the hub received from participant `name`.
    pub fn count_from(&self, name: &str, kind: MessageType) -> usize {
        lock(&self.state)
            .counters
            .get(&(name.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    /// Number of live attachments (connected links).
    pub fn attached(&self) -> usize {
        lock(&self.state).attachments.len()
    }

    /// Sever every link that joined as `name`, as if the network dropped it.
    /// Returns how many links were dropped.
    pub fn drop_participant(&self, name: &str) -> usize {
        let mut state = lock(&self.state);
        let victims: Vec<String> = state
            .attachments
            .iter()
            .filter(|(_, a)| a.name.as_deref() == Some(name))
            .map(|(id, _)| id.clone())
            .collect();
        for conn_id in &victims {
            if let Some(attachment) = state.detach(conn_id) {
                info!("Hub dropping {name} ({conn_id}) from {}", attachment.url);
                let _ = attachment
                    .tx
                    .send(Delivery::Disconnect("dropped by rendezvous service".into()));
            }
        }
        victims.len()
    }

    /// Add a roster entry with no link behind it.
    pub fn add_phantom(&self, room: &str, name: &str) {
        let mut state = lock(&self.state);
        let conn_id = format!("{PHANTOM_PREFIX}{name}");
        let members = state.rooms.entry(room.to_string()).or_default();
        if !members.iter().any(|(c, _)| *c == conn_id) {
            members.push((conn_id, name.to_string()));
        }
        state.broadcast_roster(room);
    }

    pub fn remove_phantom(&self, room: &str, name: &str) {
        let mut state = lock(&self.state);
        let conn_id = format!("{PHANTOM_PREFIX}{name}");
        if let Some(members) = state.rooms.get_mut(room) {
            members.retain(|(c, _)| *c != conn_id);
        }
        state.broadcast_roster(room);
    }

    /// Deliver a service-originated message to every member of `room`.
    pub fn inject(&self, room: &str, payload: Payload) {
        let state = lock(&self.state);
        let Some(members) = state.rooms.get(room) else {
            return;
        };
        for (conn_id, _) in members {
            if let Some(attachment) = state.attachments.get(conn_id) {
                let msg = SignalingMessage {
                    room_id: room.to_string(),
                    sender_id: SERVICE_SENDER_ID.to_string(),
                    payload: payload.clone(),
                };
                let _ = attachment.tx.send(Delivery::Message(msg));
            }
        }
    }

    fn attach(&self, url: &str) -> Result<(String, mpsc::UnboundedReceiver<Delivery>), LinkError> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(LinkError::ProbeFailed {
                url: url.to_string(),
                reason: "rendezvous service unreachable".into(),
            });
        }
        if state.refuse_remaining > 0 {
            state.refuse_remaining -= 1;
            return Err(LinkError::Handshake {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }
        state.next_conn += 1;
        let conn_id = format!("conn-{}", state.next_conn);
        let (tx, rx) = mpsc::unbounded_channel();
        state.attachments.insert(
            conn_id.clone(),
            Attachment {
                url: url.to_string(),
                room: None,
                name: None,
                tx,
            },
        );
        Ok((conn_id, rx))
    }

    fn route(&self, conn_id: &str, msg: SignalingMessage) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if !state.attachments.contains_key(conn_id) {
            return Err(LinkError::NotConnected);
        }
        state.route(conn_id, msg);
        Ok(())
    }

    fn detach(&self, conn_id: &str) {
        lock(&self.state).detach(conn_id);
    }
}

struct LoopbackConn {
    id: String,
    delivery: JoinHandle<()>,
}

/// A [`SignalingLink`] attached to a [`LoopbackHub`].
pub struct LoopbackLink {
    hub: LoopbackHub,
    handlers: Arc<LinkHandlers>,
    conn: Mutex<Option<LoopbackConn>>,
}

impl LoopbackLink {
    pub fn new(hub: LoopbackHub) -> Self {
        Self {
            hub,
            handlers: Arc::new(LinkHandlers::default()),
            conn: Mutex::new(None),
        }
    }

    /// Connection id the hub assigned, once connected.
    pub fn connection_id(&self) -> Option<String> {
        lock(&self.conn).as_ref().map(|c| c.id.clone())
    }
}

#[async_trait]
impl SignalingLink for LoopbackLink {
    async fn connect(&self, candidate_urls: &[String]) -> Result<String, LinkError> {
        if candidate_urls.is_empty() {
            return Err(LinkError::NoCandidates);
        }
        if self.is_connected() {
            return Err(LinkError::AlreadyConnected);
        }
        let mut failures = Vec::new();
        for url in candidate_urls {
            if !url.starts_with(LOOPBACK_SCHEME) {
                failures.push(LinkError::ProbeFailed {
                    url: url.clone(),
                    reason: "not a loopback URL".into(),
                });
                continue;
            }
            match self.hub.attach(url) {
                Ok((conn_id, mut rx)) => {
                    let handlers = self.handlers.clone();
                    let delivery = tokio::spawn(async move {
                        while let Some(delivery) = rx.recv().await {
                            match delivery {
                                Delivery::Message(msg) => handlers.deliver(msg),
                                Delivery::Disconnect(reason) => {
                                    handlers.report_disconnect(reason);
                                    break;
                                }
                            }
                        }
                    });
                    debug!("Loopback link attached as {conn_id}");
                    *lock(&self.conn) = Some(LoopbackConn {
                        id: conn_id,
                        delivery,
                    });
                    return Ok(url.clone());
                }
                Err(e) => {
                    warn!("Loopback candidate {url} failed: {e}");
                    failures.push(e);
                }
            }
        }
        Err(LinkError::AllCandidatesFailed(failures))
    }

    fn send(&self, msg: SignalingMessage) -> Result<(), LinkError> {
        let conn = lock(&self.conn);
        let conn = conn.as_ref().ok_or(LinkError::NotConnected)?;
        self.hub.route(&conn.id, msg)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.set_on_message(handler);
    }

    fn on_disconnected(&self, handler: DisconnectHandler) {
        self.handlers.set_on_disconnected(handler);
    }

    fn clear_handlers(&self) {
        self.handlers.clear();
    }

    fn close(&self) {
        self.handlers.silence_disconnect();
        if let Some(conn) = lock(&self.conn).take() {
            conn.delivery.abort();
            self.hub.detach(&conn.id);
            debug!("Loopback link {} closed", conn.id);
        }
    }

    fn is_connected(&self) -> bool {
        match lock(&self.conn).as_ref() {
            Some(conn) => !conn.delivery.is_finished(),
            None => false,
        }
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl LinkFactory for LoopbackHub {
    fn create(&self) -> Arc<dyn SignalingLink> {
        Arc::new(LoopbackLink::new(self.clone()))
    }
}
