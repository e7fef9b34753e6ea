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

//! Peer signaling that arrives early, late, or out of turn. The remote side
//! is a roster-only phantom; its signaling is injected through the hub.

mod test_helpers;

use std::time::Duration;
use test_helpers::*;
use tokio::sync::mpsc;
use videocall_session::tier::PeerChannel;
use videocall_session::{
    AttemptOutcome, MediaSource, RelayFrameCodec, Role, SessionEvent, SessionState,
    SimulatedNetwork, TestPatternSource, TierKind,
};
use videocall_signaling::{MessageType, Payload};
use videocall_transport::LoopbackHub;

/// An offer from a channel opened on the same simulated network, as the
/// phantom would have produced it.
fn rival_offer(net: &SimulatedNetwork) -> (Box<dyn PeerChannel>, Payload) {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut channel = net.backends().native.open(tx).expect("native backend");
    let sdp = channel.create_offer().expect("offer");
    (channel, Payload::Offer { sdp })
}

fn relay_frame() -> Payload {
    let source = TestPatternSource::new("phantom-cam", 48, 32);
    let frame = source.tracks().video.unwrap().snapshot().unwrap();
    Payload::RelayFrame {
        room_id: ROOM.to_string(),
        blob: RelayFrameCodec::default().encode(&frame).unwrap(),
        timestamp: frame.timestamp_ms,
    }
}

async fn join_then_media(p: &Participant) {
    p.session.join_room(ROOM, &p.name).await.unwrap();
    p.wait_for_state(SessionState::AwaitingMedia).await;
    p.session
        .supply_local_media(TestPatternSource::shared(&p.name, 32, 32))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn glare_loser_switches_to_answering() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let zoe = spawn_participant("zoe", test_config(&hub), &hub, &net);
    join_then_media(&zoe).await;
    zoe.wait_for_state(SessionState::MediaActive).await;

    hub.add_phantom(ROOM, "adam");
    let status = zoe
        .wait_until("initiator attempt", |s| s.role == Some(Role::Initiator))
        .await;
    assert_eq!(status.peer.as_deref(), Some("adam"));
    assert_eq!(hub.count_from("zoe", MessageType::Offer), 1);

    let (_rival, offer) = rival_offer(&net);
    hub.inject(ROOM, offer);

    let status = zoe
        .wait_until("responder attempt", |s| s.role == Some(Role::Responder))
        .await;
    assert_eq!(status.state, SessionState::Negotiating(TierKind::Native));
    assert_eq!(status.attempts.len(), 2);
    assert_eq!(status.attempts[0].outcome, AttemptOutcome::Aborted);
    assert_eq!(status.attempts[1].tier, TierKind::Native);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.count_from("zoe", MessageType::Answer), 1);
}

#[tokio::test(start_paused = true)]
async fn glare_winner_keeps_offering() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let amy = spawn_participant("amy", test_config(&hub), &hub, &net);
    join_then_media(&amy).await;
    amy.wait_for_state(SessionState::MediaActive).await;

    hub.add_phantom(ROOM, "bob");
    amy.wait_until("initiator attempt", |s| s.role == Some(Role::Initiator))
        .await;
    let (_rival, offer) = rival_offer(&net);
    hub.inject(ROOM, offer);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = amy.session.status();
    assert_eq!(status.role, Some(Role::Initiator));
    assert_eq!(status.attempts.len(), 1);
    assert_eq!(hub.count_from("amy", MessageType::Answer), 0);
}

#[tokio::test(start_paused = true)]
async fn peer_already_on_relay_pulls_negotiation_down() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let zoe = spawn_participant("zoe", test_config(&hub), &hub, &net);
    let mut events = zoe.session.events();
    join_then_media(&zoe).await;
    zoe.wait_for_state(SessionState::MediaActive).await;

    hub.add_phantom(ROOM, "adam");
    zoe.wait_for_state(SessionState::Negotiating(TierKind::Native))
        .await;
    hub.inject(ROOM, relay_frame());

    let status = zoe.wait_connected(TierKind::Relay).await;
    let tiers: Vec<TierKind> = status.attempts.iter().map(|a| a.tier).collect();
    assert_eq!(tiers, vec![TierKind::Native, TierKind::Relay]);

    let remote = zoe.wait_for_remote_video().await;
    assert_eq!(remote.tier, TierKind::Relay);
    assert_eq!(
        remote.latest_frame().map(|f| (f.width, f.height)),
        Some((48, 32))
    );

    let mut degraded = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::TierDegraded { from, to, .. } = event {
            degraded.push((from, to));
        }
    }
    assert_eq!(degraded, vec![(TierKind::Native, TierKind::Relay)]);
}

#[tokio::test(start_paused = true)]
async fn offers_before_media_are_answered_once_media_arrives() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    hub.add_phantom(ROOM, "adam");
    let zoe = spawn_participant("zoe", test_config(&hub), &hub, &net);

    zoe.session.join_room(ROOM, "zoe").await.unwrap();
    zoe.wait_for_state(SessionState::AwaitingMedia).await;
    let (_rival, offer) = rival_offer(&net);
    hub.inject(ROOM, offer);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.count_from("zoe", MessageType::Answer), 0);

    zoe.session
        .supply_local_media(TestPatternSource::shared("zoe", 32, 32))
        .await
        .unwrap();
    let status = zoe
        .wait_until("responder attempt", |s| s.role == Some(Role::Responder))
        .await;
    assert_eq!(status.peer.as_deref(), Some("adam"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.count_from("zoe", MessageType::Answer), 1);
    assert_eq!(hub.count_from("zoe", MessageType::Offer), 0);
}

#[tokio::test(start_paused = true)]
async fn early_relay_frames_skip_the_peer_channel_tiers() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    hub.add_phantom(ROOM, "adam");
    let zoe = spawn_participant("zoe", test_config(&hub), &hub, &net);

    zoe.session.join_room(ROOM, "zoe").await.unwrap();
    zoe.wait_for_state(SessionState::AwaitingMedia).await;
    hub.inject(ROOM, relay_frame());
    hub.inject(ROOM, relay_frame());
    // Let the session buffer both frames before media arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;

    zoe.session
        .supply_local_media(TestPatternSource::shared("zoe", 32, 32))
        .await
        .unwrap();
    let status = zoe.wait_connected(TierKind::Relay).await;
    let tiers: Vec<TierKind> = status.attempts.iter().map(|a| a.tier).collect();
    assert_eq!(tiers, vec![TierKind::Relay]);
    assert_eq!(hub.count_from("zoe", MessageType::Offer), 0);
    zoe.wait_for_remote_video().await;
}

#[tokio::test(start_paused = true)]
async fn partner_leaving_mid_negotiation_resets_the_cycle() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let zoe = spawn_participant("zoe", test_config(&hub), &hub, &net);
    join_then_media(&zoe).await;
    zoe.wait_for_state(SessionState::MediaActive).await;

    hub.add_phantom(ROOM, "adam");
    zoe.wait_for_state(SessionState::Negotiating(TierKind::Native))
        .await;
    hub.remove_phantom(ROOM, "adam");

    let status = zoe.wait_for_state(SessionState::MediaActive).await;
    assert_eq!(status.peer, None);
    assert_eq!(status.pending_timers, 0);

    // Nothing left to time out: the session idles in MediaActive.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(zoe.session.state(), SessionState::MediaActive);
}

#[tokio::test(start_paused = true)]
async fn repeated_roster_updates_never_reoffer() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let zoe = spawn_participant("zoe", test_config(&hub), &hub, &net);
    join_then_media(&zoe).await;
    zoe.wait_for_state(SessionState::MediaActive).await;

    hub.add_phantom(ROOM, "adam");
    zoe.wait_for_state(SessionState::Negotiating(TierKind::Native))
        .await;
    for _ in 0..3 {
        hub.add_phantom(ROOM, "adam");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    hub.add_phantom(ROOM, "carl");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = zoe.session.status();
    assert_eq!(status.peer.as_deref(), Some("adam"));
    assert_eq!(status.attempts.len(), 1);
    assert_eq!(hub.count_from("zoe", MessageType::Offer), 1);
}
