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

use clap::Parser;
mod modes;

use modes::demo::demo;
use modes::join::join;
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;
use videocall_session_cli::cli_args::{Mode, Opt};
use videocall_session_cli::load_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `try_init` also routes the session crates' `log` records into tracing.
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish()
        .try_init()?;

    let opt = Opt::parse();
    let config = load_config(opt.config.as_deref())?;
    debug!("session config: {config:?}");

    match opt.mode {
        Mode::Demo(d) => demo(d, config).await?,
        Mode::Join(j) => join(j, config).await?,
    };

    Ok(())
}
