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


//! Tests for the in-process rendezvous hub and its links.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use videocall_signaling::{Callback, MessageType, Payload, SignalingMessage};
use videocall_transport::{LinkError, LinkFactory, LoopbackHub, SignalingLink};

struct Probe {
    link: Arc<dyn SignalingLink>,
    inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    disconnects: Arc<Mutex<Vec<String>>>,
}

async fn attach(hub: &LoopbackHub) -> Probe {
    let link = hub.create();
    let (tx, inbound) = mpsc::unbounded_channel();
    link.on_message(Callback::from(move |msg: SignalingMessage| {
        let _ = tx.send(msg);
    }));
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let sink = disconnects.clone();
    link.on_disconnected(Callback::from(move |reason: String| {
        sink.lock().unwrap().push(reason);
    }));
    link.connect(&[hub.url()]).await.expect("attach to hub");
    Probe {
        link,
        inbound,
        disconnects,
    }
}

async fn next(probe: &mut Probe) -> SignalingMessage {
    tokio::time::timeout(Duration::from_secs(1), probe.inbound.recv())
        .await
        .expect("message within a second")
        .expect("channel open")
}

async fn next_roster(probe: &mut Probe) -> Vec<String> {
    loop {
        if let Payload::RosterChanged { participants } = next(probe).await.payload {
            return participants;
        }
    }
}

#[tokio::test]
async fn test_join_broadcasts_roster_to_members() {
    let hub = LoopbackHub::new();
    let mut alice = attach(&hub).await;
    let mut bob = attach(&hub).await;

    alice.link.send(SignalingMessage::join("r1", "alice")).unwrap();
    assert_eq!(next_roster(&mut alice).await, vec!["alice"]);

    bob.link.send(SignalingMessage::join("r1", "bob")).unwrap();
    assert_eq!(next_roster(&mut alice).await, vec!["alice", "bob"]);
    assert_eq!(next_roster(&mut bob).await, vec!["alice", "bob"]);
    assert_eq!(hub.roster("r1"), vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_peer_traffic_reaches_only_other_members_in_order() {
    let hub = LoopbackHub::new();
    let mut alice = attach(&hub).await;
    let mut bob = attach(&hub).await;
    alice.link.send(SignalingMessage::join("r1", "alice")).unwrap();
    bob.link.send(SignalingMessage::join("r1", "bob")).unwrap();
    next_roster(&mut bob).await;

    for i in 0..3 {
        alice
            .link
            .send(SignalingMessage::new(
                "r1",
                Payload::IceCandidate {
                    candidate: format!("c{i}"),
                },
            ))
            .unwrap();
    }
    let mut seen = Vec::new();
    while seen.len() < 3 {
        let msg = next(&mut bob).await;
        if let Payload::IceCandidate { candidate } = msg.payload {
            assert!(msg.sender_id.starts_with("conn-"));
            seen.push(candidate);
        }
    }
    assert_eq!(seen, vec!["c0", "c1", "c2"]);
    assert_eq!(hub.count_from("alice", MessageType::IceCandidate), 3);
}

#[tokio::test]
async fn test_heartbeat_is_acknowledged() {
    let hub = LoopbackHub::new();
    let mut alice = attach(&hub).await;
    alice.link.send(SignalingMessage::join("r1", "alice")).unwrap();
    alice.link.send(SignalingMessage::heartbeat("r1")).unwrap();
    loop {
        if next(&mut alice).await.payload == Payload::HeartbeatAck {
            break;
        }
    }
    assert_eq!(hub.count_from("alice", MessageType::Heartbeat), 1);
}

#[tokio::test]
async fn test_drop_reports_disconnect_once_and_updates_roster() {
    let hub = LoopbackHub::new();
    let mut alice = attach(&hub).await;
    let bob = attach(&hub).await;
    alice.link.send(SignalingMessage::join("r1", "alice")).unwrap();
    bob.link.send(SignalingMessage::join("r1", "bob")).unwrap();

    assert_eq!(hub.drop_participant("bob"), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bob.disconnects.lock().unwrap().len(), 1);
    assert!(!bob.link.is_connected());
    assert_eq!(
        bob.link.send(SignalingMessage::heartbeat("r1")),
        Err(LinkError::NotConnected)
    );

    let mut last = Vec::new();
    while let Ok(Some(msg)) =
        tokio::time::timeout(Duration::from_millis(50), alice.inbound.recv()).await
    {
        if let Payload::RosterChanged { participants } = msg.payload {
            last = participants;
        }
    }
    assert_eq!(last, vec!["alice"]);
}

#[tokio::test]
async fn test_close_never_reports_disconnect() {
    let hub = LoopbackHub::new();
    let alice = attach(&hub).await;
    alice.link.close();
    alice.link.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(alice.disconnects.lock().unwrap().is_empty());
    assert_eq!(hub.attached(), 0);
}

#[tokio::test]
async fn test_unreachable_hub_fails_every_candidate() {
    let hub = LoopbackHub::new();
    hub.set_reachable(false);
    let link = hub.create();
    let result = link
        .connect(&[hub.url(), "ws://elsewhere/ws".to_string()])
        .await;
    match result {
        Err(LinkError::AllCandidatesFailed(failures)) => assert_eq!(failures.len(), 2),
        other => panic!("expected aggregate failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_refused_connects_recover() {
    let hub = LoopbackHub::new();
    hub.refuse_next_connects(1);
    let link = hub.create();
    assert!(link.connect(&[hub.url()]).await.is_err());
    let link = hub.create();
    assert_eq!(link.connect(&[hub.url()]).await, Ok(hub.url()));
}

#[tokio::test]
async fn test_phantoms_appear_in_roster() {
    let hub = LoopbackHub::new();
    let mut alice = attach(&hub).await;
    alice.link.send(SignalingMessage::join("r1", "alice")).unwrap();
    next_roster(&mut alice).await;
    hub.add_phantom("r1", "ghost");
    assert_eq!(next_roster(&mut alice).await, vec!["alice", "ghost"]);
    hub.remove_phantom("r1", "ghost");
    assert_eq!(next_roster(&mut alice).await, vec!["alice"]);
}
