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

pub mod cli_args;
pub mod sinks;

use std::path::Path;
use videocall_session::SessionConfig;

/// Load the session configuration from `path`, or from the environment when
/// no path is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    let config = match path {
        Some(path) => SessionConfig::from_file(&path.to_string_lossy())?,
        None => SessionConfig::from_env_or_default()?,
    };
    Ok(config)
}
