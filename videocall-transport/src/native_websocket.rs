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


//! Native WebSocket signaling link using `tokio-tungstenite`.
//!
//! Each candidate URL is first probed with a plain TCP connect under the
//! probe budget; only reachable hosts get the (slower) WebSocket handshake.
//! Signaling messages travel as JSON text frames. Binary frames carrying the
//! same JSON are accepted for compatibility with binary-only relays.
//!
//! # Example
//!
//! ```no_run
//! use videocall_transport::native_websocket::WebSocketLink;
//! use videocall_transport::{LinkTimeouts, SignalingLink};
//! use videocall_signaling::{Callback, SignalingMessage};
//!
//! # async fn example() -> Result<(), videocall_transport::LinkError> {
//! let link = WebSocketLink::new(LinkTimeouts::default());
//! link.on_message(Callback::from(|msg: SignalingMessage| println!("{msg:?}")));
//! let url = link
//!     .connect(&["wss://signal-a.example/ws".into(), "wss://signal-b.example/ws".into()])
//!     .await?;
//! link.send(SignalingMessage::join("r1", "alice"))?;
//! # Ok(())
//! # }
//! ```

use crate::link::{
    lock, DisconnectHandler, LinkError, LinkFactory, LinkHandlers, LinkTimeouts, MessageHandler,
    SignalingLink,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use videocall_signaling::SignalingMessage;

struct ActiveSocket {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

/// A [`SignalingLink`] over a native WebSocket.
pub struct WebSocketLink {
    timeouts: LinkTimeouts,
    handlers: Arc<LinkHandlers>,
    socket: Mutex<Option<ActiveSocket>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for WebSocketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketLink")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl WebSocketLink {
    pub fn new(timeouts: LinkTimeouts) -> Self {
        Self {
            timeouts,
            handlers: Arc::new(LinkHandlers::default()),
            socket: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// URL the link is currently attached to, if any.
    pub fn connected_url(&self) -> Option<String> {
        lock(&self.socket).as_ref().map(|s| s.url.clone())
    }

    async fn probe(&self, url: &Url) -> Result<(), LinkError> {
        let host = url.host_str().ok_or_else(|| LinkError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".into(),
        })?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| LinkError::InvalidUrl {
                url: url.to_string(),
                reason: "missing port".into(),
            })?;
        match tokio::time::timeout(self.timeouts.probe, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(LinkError::ProbeFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(LinkError::ProbeFailed {
                url: url.to_string(),
                reason: format!("no answer within {}ms", self.timeouts.probe.as_millis()),
            }),
        }
    }

    async fn try_candidate(&self, candidate: &str) -> Result<(), LinkError> {
        let url = parse_ws_url(candidate)?;
        self.probe(&url).await?;

        let handshake = tokio_tungstenite::connect_async(url.as_str());
        let (ws_stream, response) = match tokio::time::timeout(self.timeouts.handshake, handshake)
            .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(LinkError::Handshake {
                    url: candidate.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(LinkError::HandshakeTimeout {
                    url: candidate.to_string(),
                    timeout_ms: self.timeouts.handshake.as_millis() as u64,
                })
            }
        };
        info!(
            "WebSocket signaling link connected to {candidate} (HTTP {})",
            response.status()
        );

        let (mut writer, mut reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let is_close = matches!(frame, Message::Close(_));
                if let Err(e) = writer.send(frame).await {
                    debug!("WebSocket writer stopped: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
            debug!("WebSocket writer loop ended");
        });

        let handlers = self.handlers.clone();
        let closed = self.closed.clone();
        let url_for_reader = candidate.to_string();
        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_text(&text) {
                        Ok(msg) => handlers.deliver(msg),
                        Err(e) => warn!("Dropping frame from {url_for_reader}: {e}"),
                    },
                    Some(Ok(Message::Binary(data))) => {
                        match SignalingMessage::try_from(data.as_slice()) {
                            Ok(msg) => handlers.deliver(msg),
                            Err(e) => warn!("Dropping binary frame from {url_for_reader}: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break format!("server closed the connection: {frame:?}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "stream ended".to_string(),
                }
            };
            if !closed.load(Ordering::Acquire) {
                error!("WebSocket signaling link to {url_for_reader} lost: {reason}");
                handlers.report_disconnect(reason);
            }
            debug!("WebSocket reader loop ended");
        });

        let mut socket = lock(&self.socket);
        // `close` may have run during the handshake; it found no socket then.
        if self.closed.load(Ordering::Acquire) {
            drop(socket);
            let _ = outbound_tx.send(Message::Close(None));
            reader_task.abort();
            info!("WebSocket signaling link to {candidate} closed during connect");
            return Err(LinkError::NotConnected);
        }
        *socket = Some(ActiveSocket {
            url: candidate.to_string(),
            outbound: outbound_tx,
            reader: reader_task,
        });
        Ok(())
    }
}

fn parse_ws_url(candidate: &str) -> Result<Url, LinkError> {
    let url = Url::parse(candidate).map_err(|e| LinkError::InvalidUrl {
        url: candidate.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(LinkError::InvalidUrl {
            url: candidate.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

#[async_trait]
impl SignalingLink for WebSocketLink {
    async fn connect(&self, candidate_urls: &[String]) -> Result<String, LinkError> {
        if candidate_urls.is_empty() {
            return Err(LinkError::NoCandidates);
        }
        if self.is_connected() {
            return Err(LinkError::AlreadyConnected);
        }
        let mut failures = Vec::with_capacity(candidate_urls.len());
        for candidate in candidate_urls {
            if self.closed.load(Ordering::Acquire) {
                return Err(LinkError::NotConnected);
            }
            match self.try_candidate(candidate).await {
                Ok(()) => return Ok(candidate.clone()),
                Err(LinkError::NotConnected) => return Err(LinkError::NotConnected),
                Err(e) => {
                    warn!("Signaling candidate {candidate} failed: {e}");
                    failures.push(e);
                }
            }
        }
        Err(LinkError::AllCandidatesFailed(failures))
    }

    fn send(&self, msg: SignalingMessage) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::NotConnected);
        }
        let socket = lock(&self.socket);
        let socket = socket.as_ref().ok_or(LinkError::NotConnected)?;
        let text = msg.to_text().map_err(|e| LinkError::Encode(e.to_string()))?;
        socket
            .outbound
            .send(Message::Text(text))
            .map_err(|_| LinkError::NotConnected)
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
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.handlers.silence_disconnect();
        if let Some(socket) = lock(&self.socket).take() {
            if socket.outbound.send(Message::Close(None)).is_err() {
                debug!("WebSocket writer already gone while closing {}", socket.url);
            }
            socket.reader.abort();
            info!("WebSocket signaling link to {} closed", socket.url);
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && lock(&self.socket).is_some()
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates a fresh [`WebSocketLink`] per (re)connection.
#[derive(Debug, Clone, Default)]
pub struct WebSocketLinkFactory {
    pub timeouts: LinkTimeouts,
}

impl LinkFactory for WebSocketLinkFactory {
    fn create(&self) -> Arc<dyn SignalingLink> {
        Arc::new(WebSocketLink::new(self.timeouts))
    }
}
