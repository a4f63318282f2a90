//! Connection options shared by socket clients and server connections.

use crate::error::{MosError, Result};
use crate::protocol::{WireEncoding, DEFAULT_MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time to wait for a reply to a command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default delay between reconnect attempts.
pub const DEFAULT_AUTO_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Default limit for a single TCP connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Tunables for a MOS connection.
///
/// Deserializes from camelCase keys; every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// How long a command waits for its reply.
    pub command_timeout_ms: u64,
    /// Requested heartbeat interval. Never shorter than the command timeout.
    pub heartbeat_interval_ms: Option<u64>,
    /// Delay before reconnecting a dropped or failed socket.
    pub auto_reconnect_interval_ms: u64,
    /// Limit for a single TCP connect attempt.
    pub connect_timeout_ms: u64,
    /// Largest document accepted from a peer.
    pub max_message_size: usize,
    /// Encoding used for outbound documents.
    pub wire_encoding: WireEncoding,
    /// Log every sent and received document.
    pub debug: bool,
    /// Strict message validation. Consumed by message builders, not by the core.
    pub strict: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: None,
            auto_reconnect_interval_ms: DEFAULT_AUTO_RECONNECT_INTERVAL.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            wire_encoding: WireEncoding::default(),
            debug: false,
            strict: false,
        }
    }
}

impl ConnectionOptions {
    /// Check the options for values the core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            return Err(MosError::config("commandTimeoutMs must be greater than zero"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(MosError::config("connectTimeoutMs must be greater than zero"));
        }
        if self.max_message_size == 0 {
            return Err(MosError::config("maxMessageSize must be greater than zero"));
        }
        Ok(())
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_auto_reconnect_interval(mut self, interval: Duration) -> Self {
        self.auto_reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_wire_encoding(mut self, encoding: WireEncoding) -> Self {
        self.wire_encoding = encoding;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn auto_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.auto_reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Effective heartbeat period: the configured interval, clamped to at least
    /// the command timeout so a slow peer is never probed faster than it can answer.
    pub fn heartbeat_period(&self) -> Duration {
        let interval = Duration::from_millis(self.heartbeat_interval_ms.unwrap_or(0));
        interval.max(self.command_timeout())
    }
}
