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

//! Error types for the session orchestrator.

use std::fmt;
use videocall_transport::LinkError;

/// Coarse classification attached to every [`SessionError`] and to the
/// terminal `Error` session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Link drop or send failure. Recovered through the reconnection policy.
    TransientNetwork,
    /// A tier did not reach Connected within its budget. Recovered by
    /// degrading to the next tier.
    NegotiationTimeout,
    /// No signaling URL reachable, reconnection exhausted, or no usable tier.
    TerminalCapability,
    /// The caller used the API in a way the current state does not allow.
    CallerMisuse,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNetwork | ErrorClass::NegotiationTimeout
        )
    }

    /// Whether the class should be surfaced to the end user. Retryable
    /// classes are handled internally and only logged.
    pub fn is_user_visible(self) -> bool {
        !self.is_retryable()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::NegotiationTimeout => "negotiation_timeout",
            ErrorClass::TerminalCapability => "terminal_capability",
            ErrorClass::CallerMisuse => "caller_misuse",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct SessionError {
    pub class: ErrorClass,
    pub message: String,
}

impl SessionError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::CallerMisuse, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::TerminalCapability, message)
    }

    pub fn is_misuse(&self) -> bool {
        self.class == ErrorClass::CallerMisuse
    }
}

impl From<LinkError> for SessionError {
    fn from(err: LinkError) -> Self {
        let class = match err {
            LinkError::NotConnected => ErrorClass::TransientNetwork,
            LinkError::AlreadyConnected => ErrorClass::CallerMisuse,
            _ => ErrorClass::TerminalCapability,
        };
        SessionError::new(class, err.to_string())
    }
}

/// Failures reported by tier backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer channel unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected {0} in this negotiation phase")]
    UnexpectedSignal(&'static str),
    #[error("malformed session description: {0}")]
    MalformedDescription(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer channel closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayCodecError {
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("frame dimensions {width}x{height} are not encodable")]
    Dimensions { width: u32, height: u32 },
    #[error("relay blob is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("relay blob too short ({0} bytes)")]
    Truncated(usize),
    #[error("relay blob has unknown magic")]
    BadMagic,
    #[error("unsupported relay blob version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported relay payload format {0}")]
    UnsupportedFormat(u8),
    #[error("image codec: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {name}: {value}")]
    Env { name: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}
