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

//! Link loss, reconnection and the heartbeat lifecycle.

mod test_helpers;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use test_helpers::*;
use videocall_session::{
    ErrorClass, SessionEvent, SessionState, SimulatedNetwork, TestPatternSource, TierKind,
    TrackKind,
};
use videocall_signaling::MessageType;
use videocall_transport::LoopbackHub;

async fn connect_pair(hub: &LoopbackHub, net: &SimulatedNetwork) -> (Participant, Participant) {
    let alice = spawn_participant("alice", test_config(hub), hub, net);
    let bob = spawn_participant("bob", test_config(hub), hub, net);
    for p in [&alice, &bob] {
        p.session.join_room(ROOM, &p.name).await.unwrap();
        p.session
            .supply_local_media(TestPatternSource::shared(&p.name, 32, 32))
            .await
            .unwrap();
        p.wait_until("media accepted", |s| {
            matches!(
                s.state,
                SessionState::MediaActive | SessionState::Negotiating(_) | SessionState::Connected(_)
            )
        })
        .await;
    }
    alice.wait_connected(TierKind::Native).await;
    bob.wait_connected(TierKind::Native).await;
    bob.wait_for_remote_video().await;
    (alice, bob)
}

#[tokio::test(start_paused = true)]
async fn dropped_link_clears_media_and_rejoins() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let (alice, bob) = connect_pair(&hub, &net).await;

    assert_eq!(hub.drop_participant("bob"), 1);
    alice.wait_for_state(SessionState::MediaActive).await;
    bob.wait_for_state(SessionState::Disconnected).await;

    let b = bob.wait_connected(TierKind::Native).await;
    alice.wait_connected(TierKind::Native).await;
    assert_eq!(b.reconnect_attempt, 0);
    assert_eq!(hub.count_from("alice", MessageType::Offer), 2);
    assert_eq!(hub.count_from("bob", MessageType::JoinRoom), 2);

    // The stale render is cleared before the new join starts.
    let cleared = bob.trace.position("bind:none").expect("sink cleared");
    let down = bob
        .trace
        .position_after("state:disconnected", cleared)
        .expect("disconnected after clearing");
    assert!(bob.trace.position_after("state:joining", down).is_some());
    assert!(bob.sink.bind_calls() >= 3);
}

#[tokio::test(start_paused = true)]
async fn refused_reconnects_are_retried_with_backoff() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let (_alice, bob) = connect_pair(&hub, &net).await;
    let mut events = bob.session.events();

    hub.refuse_next_connects(2);
    hub.drop_participant("bob");
    bob.wait_for_state(SessionState::Disconnected).await;
    let b = bob.wait_connected(TierKind::Native).await;
    assert_eq!(b.reconnect_attempt, 0);

    let mut scheduled = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ReconnectScheduled { attempt, delay_ms } = event {
            scheduled.push((attempt, delay_ms));
        }
    }
    assert_eq!(scheduled, vec![(1, 1000), (2, 2000), (3, 4000)]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_end_in_terminal_error() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let (alice, bob) = connect_pair(&hub, &net).await;

    hub.set_reachable(false);
    hub.drop_participant("bob");
    let status = bob
        .wait_until("terminal error", |s| s.state.is_terminal())
        .await;

    match &status.state {
        SessionState::Error { class, reason } => {
            assert_eq!(*class, ErrorClass::TerminalCapability);
            assert!(reason.contains('5'), "{reason}");
        }
        other => panic!("expected error, got {other}"),
    }
    assert_eq!(status.pending_timers, 0);
    assert!(!status.heartbeat_active);
    assert!(bob.sink.current().is_none());
    assert_eq!(hub.count_from("bob", MessageType::JoinRoom), 1);
    assert_eq!(alice.session.state(), SessionState::MediaActive);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_runs_only_while_waiting_for_media() {
    let hub = LoopbackHub::new();
    hub.set_heartbeat_acks(false);
    let net = SimulatedNetwork::new();
    let zoe = spawn_participant("zoe", test_config(&hub), &hub, &net);
    let mut events = zoe.session.events();

    zoe.session.join_room(ROOM, "zoe").await.unwrap();
    let status = zoe.wait_for_state(SessionState::AwaitingMedia).await;
    assert!(status.heartbeat_active);

    tokio::time::sleep(Duration::from_millis(21_000)).await;
    assert_eq!(hub.count_from("zoe", MessageType::Heartbeat), 4);
    let mut missed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::HeartbeatMissed { outstanding } = event {
            missed.push(outstanding);
        }
    }
    assert_eq!(missed, vec![4]);

    zoe.session
        .supply_local_media(TestPatternSource::shared("zoe", 16, 16))
        .await
        .unwrap();
    let status = zoe.wait_for_state(SessionState::MediaActive).await;
    assert!(!status.heartbeat_active);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(hub.count_from("zoe", MessageType::Heartbeat), 4);
}

/// Whatever happens to the link, the heartbeat is active exactly while the
/// session waits for media.
#[tokio::test(start_paused = true)]
async fn heartbeat_tracks_awaiting_media_under_random_churn() {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    let solo = spawn_participant("solo", test_config(&hub), &hub, &net);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    solo.session.join_room(ROOM, "solo").await.unwrap();
    solo.wait_for_state(SessionState::AwaitingMedia).await;

    let mut acks = true;
    for step in 0..80 {
        match rng.gen_range(0..7) {
            0 => {
                let camera = TestPatternSource::shared(&format!("cam-{step}"), 16, 16);
                let _ = solo.session.supply_local_media(camera).await;
            }
            1 => {
                hub.drop_participant("solo");
            }
            2 => hub.add_phantom(ROOM, &format!("peer{}", rng.gen_range(0..3))),
            3 => hub.remove_phantom(ROOM, &format!("peer{}", rng.gen_range(0..3))),
            4 => {
                acks = !acks;
                hub.set_heartbeat_acks(acks);
            }
            5 => {
                let _ = solo.session.toggle_local_track(TrackKind::Video).await;
            }
            _ => tokio::time::sleep(Duration::from_millis(rng.gen_range(0..8_000))).await,
        }
        tokio::task::yield_now().await;
        let status = solo.session.status();
        assert_eq!(
            status.heartbeat_active,
            status.state == SessionState::AwaitingMedia,
            "step {step}: {}",
            status.state
        );
    }

    let observed = solo.observed();
    assert!(observed.len() > 3);
    for status in observed {
        assert_eq!(
            status.heartbeat_active,
            status.state == SessionState::AwaitingMedia,
            "{}",
            status.state
        );
    }

    solo.session.end_session().await;
    assert!(!solo.session.status().heartbeat_active);
}
