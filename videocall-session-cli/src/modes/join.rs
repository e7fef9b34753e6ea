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

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use videocall_session::{SessionConfig, SessionEvent, SessionHandle, TestPatternSource, TierBackends};
use videocall_session_cli::cli_args::Join;
use videocall_session_cli::sinks::LoggingSink;
use videocall_transport::native_websocket::WebSocketLinkFactory;

pub async fn join(opt: Join, config: SessionConfig) -> anyhow::Result<()> {
    let mut config = config;
    if !opt.urls.is_empty() {
        config.signaling_urls = opt.urls.iter().map(|u| u.to_string()).collect();
    }
    info!("signaling candidates: {:?}", config.signaling_urls);

    let links = Arc::new(WebSocketLinkFactory {
        timeouts: config.link_timeouts(),
    });
    let sink = LoggingSink::new(&opt.name);
    // No peer-channel stack in the CLI: every call rides the relay tier.
    let session = SessionHandle::spawn(config, links, TierBackends::relay_only(), sink.clone())
        .context("invalid session configuration")?;

    let mut events = session.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { from, to } => info!("{from} -> {to}"),
                SessionEvent::HeartbeatMissed { outstanding } => {
                    warn!("{outstanding} heartbeats unanswered")
                }
                other => info!("{other:?}"),
            }
        }
    });

    session
        .join_room(&opt.room, &opt.name)
        .await
        .with_context(|| format!("failed to join {}", opt.room))?;
    session
        .supply_local_media(TestPatternSource::shared(
            &format!("{}-pattern", opt.name),
            opt.resolution.width,
            opt.resolution.height,
        ))
        .await?;

    let mut status = session.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, leaving {}", opt.room),
        _ = status.wait_for(|s| s.state.is_terminal()) => {
            warn!("session stopped: {}", session.state());
        }
    }

    session.end_session().await;
    info!("rendered {} remote frames", sink.frames_seen());
    Ok(())
}
