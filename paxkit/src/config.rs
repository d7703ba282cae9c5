//! Configuration surface.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use paxkit_core::DEFAULT_MAX_FRAME;
use paxkit_core::error::{ConfigError, validate_tunables};

use crate::strategy::{BasicPaxosFactory, StrategyFactory};

/// Tunables shared by clients and servers.
///
/// Invalid values are rejected at `Client::new`/`Server::new`; nothing else
/// in the library validates them again.
#[derive(Clone)]
pub struct Configuration {
    /// Period of the handshake / election / announcement tick.
    pub heartbeat_interval: Duration,
    /// Fixed delay between client retry attempts.
    pub retry_backoff: Duration,
    /// Retries a `send` gets unless overridden per call.
    pub default_retries: u32,
    /// Frame cap for the command codec. At least 16 MiB.
    pub max_frame_size: usize,
    /// Round algorithm used by servers. The default is basic Paxos; tests
    /// inject misbehaving implementations here.
    pub strategy_factory: Arc<dyn StrategyFactory>,
    /// Run the event loop on this runtime instead of spawning a worker
    /// thread.
    pub runtime: Option<tokio::runtime::Handle>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            retry_backoff: Duration::from_millis(500),
            default_retries: 3,
            max_frame_size: DEFAULT_MAX_FRAME,
            strategy_factory: Arc::new(BasicPaxosFactory),
            runtime: None,
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("retry_backoff", &self.retry_backoff)
            .field("default_retries", &self.default_retries)
            .field("max_frame_size", &self.max_frame_size)
            .field("external_runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl Configuration {
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_tunables(
            self.heartbeat_interval,
            self.retry_backoff,
            self.max_frame_size,
        )
    }

    /// Deadline for a single handshake exchange (dial included).
    pub(crate) fn handshake_deadline(&self) -> Duration {
        self.heartbeat_interval / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn undersized_frame_cap_is_invalid() {
        let config = Configuration {
            max_frame_size: 1024,
            ..Configuration::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::FrameCapTooSmall { got: 1024 })
        );
    }
}
