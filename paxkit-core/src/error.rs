//! Error taxonomy.
//!
//! Transport, protocol, and timeout failures are absorbed inside the
//! library: they degrade peer liveness or fail a round, but are never
//! surfaced as such. A caller only ever observes [`SendError`] on a request
//! or [`ConfigError`] at startup.

use std::fmt;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME;

/// Client-visible outcome when a request cannot produce a reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendError {
    /// The round failed or retries were exhausted. Also used to drain
    /// in-flight requests on shutdown: every request is fulfilled exactly
    /// once.
    RequestError,
    /// The quorum has no live majority or no known leader. Not retried;
    /// the caller is expected to await readiness.
    NotReady,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::RequestError => f.write_str("request failed"),
            SendError::NotReady => f.write_str("quorum is not ready"),
        }
    }
}

impl std::error::Error for SendError {}

/// Rejected configuration, reported at startup only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    ZeroHeartbeatInterval,
    ZeroRetryBackoff,
    FrameCapTooSmall { got: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroHeartbeatInterval => {
                f.write_str("heartbeat_interval must be non-zero")
            }
            ConfigError::ZeroRetryBackoff => f.write_str("retry_backoff must be non-zero"),
            ConfigError::FrameCapTooSmall { got } => write!(
                f,
                "maximum_frame_size must be at least {DEFAULT_MAX_FRAME} bytes, got {got}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validate the tunable durations and sizes shared by clients and servers.
///
/// # Errors
///
/// Returns the first violated constraint.
pub fn validate_tunables(
    heartbeat_interval: Duration,
    retry_backoff: Duration,
    max_frame_size: usize,
) -> Result<(), ConfigError> {
    if heartbeat_interval.is_zero() {
        return Err(ConfigError::ZeroHeartbeatInterval);
    }
    if retry_backoff.is_zero() {
        return Err(ConfigError::ZeroRetryBackoff);
    }
    if max_frame_size < DEFAULT_MAX_FRAME {
        return Err(ConfigError::FrameCapTooSmall {
            got: max_frame_size,
        });
    }
    Ok(())
}
