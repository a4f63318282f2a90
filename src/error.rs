//! Error types for the MOS transport core.

use crate::message::{MessageId, PortType};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type alias for MOS operations.
pub type Result<T> = std::result::Result<T, MosError>;

/// Errors that can occur when talking MOS to a peer.
#[derive(Debug, thiserror::Error)]
pub enum MosError {
    /// IO error from the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A received document could not be decoded.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// No reply arrived before the command deadline.
    #[error("Command {message_id} on {port} port timed out after {} ms", .timeout.as_millis())]
    Timeout {
        message_id: MessageId,
        port: PortType,
        timeout: Duration,
    },

    /// The client or connection has been disposed.
    #[error("Disposed")]
    Disposed,

    /// The port role is not one of lower, upper or query.
    #[error("No \"{0}\" ports found")]
    UnknownPort(String),

    /// The port role is valid but no client is registered for it.
    #[error("executeCommand: No clients found for {0}")]
    NoClients(PortType),

    /// A command with the same message ID is already awaiting a reply.
    #[error("Message ID {0} is already pending")]
    DuplicateMessageId(MessageId),

    /// Connection closed before the command could complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A heartbeat on one port role failed.
    #[error("Heartbeat error on {port}: {source}")]
    Heartbeat {
        port: PortType,
        #[source]
        source: Box<MosError>,
    },

    /// An error raised by one of the socket clients of a server connection.
    #[error("MosSocketClient: {0}")]
    SocketClient(#[source] Arc<MosError>),

    /// Invalid connection options.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl MosError {
    /// Create a configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        MosError::Config(msg.to_string())
    }

    /// Create a parse error from a reason and the offending text.
    pub fn parse(reason: impl fmt::Display, text: impl Into<String>) -> Self {
        MosError::Parse(ParseError::new(reason, text))
    }

    /// Whether this error is a command timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MosError::Timeout { .. })
    }

    /// Whether this error was caused by disposal.
    pub fn is_disposed(&self) -> bool {
        matches!(self, MosError::Disposed)
    }
}

/// A document that could not be parsed as a MOS message.
///
/// Carries the original text so the caller can log or inspect what was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse MOS message: {reason}")]
pub struct ParseError {
    /// Why parsing failed.
    pub reason: String,
    /// The offending document or fragment.
    pub text: String,
}

impl ParseError {
    pub fn new(reason: impl fmt::Display, text: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            text: text.into(),
        }
    }
}
