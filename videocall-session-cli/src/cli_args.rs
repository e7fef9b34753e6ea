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

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// Videocall session CLI
///
/// Drives the connection-establishment orchestrator from the command line,
/// either as a self-contained two-party demo or as a single participant
/// against a running rendezvous service.
#[derive(Parser, Debug)]
#[clap(name = "videocall-session")]
pub struct Opt {
    /// YAML session configuration. Falls back to `SESSION_CONFIG_PATH` and the
    /// individual environment overrides when omitted.
    #[clap(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run two participants against an in-process rendezvous hub.
    Demo(Demo),

    /// Join a room on a live rendezvous service, sending a test pattern over
    /// the relay tier.
    Join(Join),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("invalid resolution {s}, expected WIDTHxHEIGHT"))?;
        let width = w.parse::<u32>().map_err(|e| format!("invalid width {w}: {e}"))?;
        let height = h.parse::<u32>().map_err(|e| format!("invalid height {h}: {e}"))?;
        if width == 0 || height == 0 {
            return Err("resolution must be non-zero".to_string());
        }
        Ok(Resolution { width, height })
    }
}

#[derive(Args, Debug, Clone)]
pub struct Demo {
    #[clap(long = "room", default_value = "demo")]
    pub room: String,

    /// Make the native peer channel fail once both sides exchanged
    /// descriptions.
    #[clap(long = "fail-native")]
    pub fail_native: bool,

    /// Make the secondary peer channel fail as well.
    #[clap(long = "fail-secondary")]
    pub fail_secondary: bool,

    /// Drop the second participant's signaling link once connected, to
    /// watch it reconnect.
    #[clap(long = "drop-link")]
    pub drop_link: bool,

    /// Test pattern resolution in WIDTHxHEIGHT format.
    #[clap(long = "resolution", short = 'r', default_value = "320x240")]
    pub resolution: Resolution,

    /// How long to keep the call up once connected.
    #[clap(long = "duration-secs", default_value = "5")]
    pub duration_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct Join {
    /// Rendezvous service URL. Repeat to give fallbacks, tried in order.
    #[clap(long = "url")]
    pub urls: Vec<Url>,

    #[clap(long = "room")]
    pub room: String,

    #[clap(long = "name")]
    pub name: String,

    /// Test pattern resolution in WIDTHxHEIGHT format.
    #[clap(long = "resolution", short = 'r', default_value = "320x240")]
    pub resolution: Resolution,
}
