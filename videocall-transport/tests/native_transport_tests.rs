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


//! Tests for the native WebSocket signaling link.
//!
//! These cover the connect failure paths and a local server with a slow
//! handshake. Tests that need a running signaling server are marked with
//! `#[ignore]`.

#[cfg(feature = "native")]
mod websocket_link_tests {
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use videocall_signaling::SignalingMessage;
    use videocall_transport::native_websocket::WebSocketLink;
    use videocall_transport::{LinkError, LinkTimeouts, SignalingLink};

    fn quick_timeouts() -> LinkTimeouts {
        LinkTimeouts {
            probe: Duration::from_millis(200),
            handshake: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_connect_requires_candidates() {
        let link = WebSocketLink::new(quick_timeouts());
        assert_eq!(link.connect(&[]).await, Err(LinkError::NoCandidates));
    }

    #[tokio::test]
    async fn test_connect_fails_with_bad_scheme() {
        let link = WebSocketLink::new(quick_timeouts());
        let result = link.connect(&["ftp://localhost:8080/ws".to_string()]).await;
        match result {
            Err(LinkError::AllCandidatesFailed(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(failures[0], LinkError::InvalidUrl { .. }));
            }
            other => panic!("expected aggregate failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_candidates_fail_at_probe() {
        let link = WebSocketLink::new(quick_timeouts());
        let result = link
            .connect(&[
                "ws://127.0.0.1:1/ws".to_string(),
                "not-a-url".to_string(),
            ])
            .await;
        match result {
            Err(LinkError::AllCandidatesFailed(failures)) => {
                assert_eq!(failures.len(), 2);
                assert!(matches!(failures[0], LinkError::ProbeFailed { .. }));
                assert!(matches!(failures[1], LinkError::InvalidUrl { .. }));
            }
            other => panic!("expected aggregate failure, got {other:?}"),
        }
        assert!(!link.is_connected());
        assert_eq!(
            link.send(SignalingMessage::heartbeat("r1")),
            Err(LinkError::NotConnected)
        );
    }

    /// Accepts every TCP connection but only completes the WebSocket
    /// handshake after `delay`. Reports what the server saw on the first
    /// upgraded connection: `true` once the client went away.
    async fn slow_server(delay: Duration) -> (String, mpsc::UnboundedReceiver<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The reachability probe hangs up without upgrading.
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let gone = match tokio::time::timeout(Duration::from_secs(2), ws.next()).await
                    {
                        Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => true,
                        Ok(Some(Ok(_))) | Err(_) => false,
                    };
                    let _ = seen_tx.send(gone);
                });
            }
        });
        (url, seen_rx)
    }

    #[tokio::test]
    async fn test_close_during_handshake_releases_the_socket() {
        let (url, mut seen) = slow_server(Duration::from_millis(300)).await;
        let link = Arc::new(WebSocketLink::new(LinkTimeouts {
            probe: Duration::from_millis(500),
            handshake: Duration::from_secs(2),
        }));

        let connecting = {
            let link = link.clone();
            tokio::spawn(async move { link.connect(&[url]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        link.close();

        let result = connecting.await.unwrap();
        assert_eq!(result, Err(LinkError::NotConnected));
        assert!(!link.is_connected());
        assert_eq!(link.connected_url(), None);

        let gone = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("server upgraded the connection")
            .expect("server task alive");
        assert!(gone, "connection stayed open after close()");
    }

    /// Integration test: requires a signaling server on localhost:8080.
    #[tokio::test]
    #[ignore]
    async fn test_connect_send_close_roundtrip() {
        let link = WebSocketLink::new(LinkTimeouts::default());
        let url = link
            .connect(&["ws://localhost:8080/ws".to_string()])
            .await
            .expect("Failed to connect");
        assert_eq!(url, "ws://localhost:8080/ws");
        link.send(SignalingMessage::join("r1", "alice"))
            .expect("Failed to send");
        link.close();
        assert!(!link.is_connected());
    }
}
