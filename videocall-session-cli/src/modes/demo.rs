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

use anyhow::{anyhow, Context};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use videocall_session::{
    SessionConfig, SessionEvent, SessionHandle, SessionStatus, SimBehavior, SimulatedNetwork,
    TestPatternSource,
};
use videocall_session_cli::cli_args::Demo;
use videocall_session_cli::sinks::LoggingSink;
use videocall_signaling::MessageType;
use videocall_transport::LoopbackHub;

const CONNECT_BUDGET: Duration = Duration::from_secs(90);
const PARTICIPANTS: [&str; 2] = ["alice", "bob"];

struct Participant {
    name: &'static str,
    session: SessionHandle,
    sink: Arc<LoggingSink>,
}

fn log_events(name: &'static str, session: &SessionHandle) {
    let mut events = session.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { from, to } => info!("[{name}] {from} -> {to}"),
                SessionEvent::TierDegraded { from, to, reason } => {
                    warn!("[{name}] {from} failed ({reason}), falling back to {to}")
                }
                other => info!("[{name}] {other:?}"),
            }
        }
    });
}

async fn wait_connected(p: &Participant) -> anyhow::Result<SessionStatus> {
    let status = tokio::time::timeout(
        CONNECT_BUDGET,
        p.session
            .wait_for(|s| s.state.is_connected() || s.state.is_terminal()),
    )
    .await
    .with_context(|| format!("{} did not connect within {CONNECT_BUDGET:?}", p.name))?
    .ok_or_else(|| anyhow!("{} session stopped", p.name))?;
    if status.state.is_terminal() {
        return Err(anyhow!("{} ended up in {}", p.name, status.state));
    }
    Ok(status)
}

fn summarize(p: &Participant, status: &SessionStatus) {
    let tiers: Vec<String> = status
        .attempts
        .iter()
        .map(|a| format!("{}={:?}", a.tier, a.outcome))
        .collect();
    println!(
        "{:>6}: {} as {} with {}, attempts [{}], {} frames rendered",
        p.name,
        status.state,
        status.role.map(|r| r.to_string()).unwrap_or_default(),
        status.peer.as_deref().unwrap_or("-"),
        tiers.join(", "),
        p.sink.frames_seen()
    );
}

pub async fn demo(opt: Demo, config: SessionConfig) -> anyhow::Result<()> {
    let hub = LoopbackHub::new();
    let net = SimulatedNetwork::new();
    if opt.fail_native {
        net.set_native(SimBehavior::Fails);
    }
    if opt.fail_secondary {
        net.set_secondary(SimBehavior::Fails);
    }
    let mut config = config;
    config.signaling_urls = vec![hub.url()];

    let mut participants = Vec::new();
    for name in PARTICIPANTS {
        let sink = LoggingSink::new(name);
        let session = SessionHandle::spawn(
            config.clone(),
            Arc::new(hub.clone()),
            net.backends(),
            sink.clone(),
        )?;
        log_events(name, &session);
        session.join_room(&opt.room, name).await?;
        session
            .supply_local_media(TestPatternSource::shared(
                &format!("{name}-pattern"),
                opt.resolution.width,
                opt.resolution.height,
            ))
            .await?;
        participants.push(Participant {
            name,
            session,
            sink,
        });
    }

    for p in &participants {
        wait_connected(p).await?;
    }

    if opt.drop_link {
        info!("dropping bob's signaling link");
        hub.drop_participant("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;
        for p in &participants {
            wait_connected(p).await?;
        }
    }

    tokio::time::sleep(Duration::from_secs(opt.duration_secs)).await;

    println!("room {}: roster {:?}", opt.room, hub.roster(&opt.room));
    for p in &participants {
        summarize(p, &p.session.status());
    }
    for kind in [
        MessageType::Offer,
        MessageType::SecondarySignal,
        MessageType::RelayFrame,
    ] {
        println!(
            "{:>16}: alice sent {}, bob sent {}",
            kind.to_string(),
            hub.count_from("alice", kind),
            hub.count_from("bob", kind)
        );
    }

    for p in &participants {
        p.session.end_session().await;
    }
    Ok(())
}
