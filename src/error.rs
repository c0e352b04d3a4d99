//! Error types for taskwire.
//!
//! Every failure carries a [`ErrorKind`] so callers can tell transport
//! problems (retried by the task client) from protocol, execution and policy
//! outcomes without matching on individual variants.

use thiserror::Error;

/// Broad classification of a [`TaskwireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection is gone or unusable. Drives task-level retry.
    Transport,
    /// The peer sent something the protocol does not allow here.
    Protocol,
    /// The remote work ran and failed.
    Execution,
    /// A terminal outcome decided by retry, timeout, cancel or selection policy.
    Policy,
    /// A local problem (configuration, encoding).
    Local,
}

/// Main error type for all taskwire operations.
#[derive(Debug, Error)]
pub enum TaskwireError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Frame header or payload violates the wire format.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Connection closed, locally or by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No frame arrived from the peer within the heartbeat timeout.
    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    /// Write buffer stayed full for longer than the backpressure timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Message envelope or body could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A one-shot exchange got a different message than the one it waits for.
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType {
        expected: &'static str,
        actual: &'static str,
    },

    /// The work unit or one of its dependencies could not be materialized.
    #[error("Deserialization failed: {message}")]
    Deserialization {
        message: String,
        detail: Option<String>,
    },

    /// The work unit was decoded and raised an error while running.
    #[error("Invocation failed: {message}")]
    Invokation {
        message: String,
        detail: Option<String>,
    },

    /// Any other fault on the runner.
    #[error("Runner fault: {message}")]
    General {
        message: String,
        detail: Option<String>,
    },

    /// The mediator found no runner matching the request filters.
    #[error("No available runner: {0}")]
    NoAvailableRunner(String),

    /// Every permitted attempt failed at the transport level.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TaskwireError>,
    },

    /// The task deadline elapsed before a terminal response arrived.
    #[error("Task timed out")]
    TimedOut,

    /// The caller cancelled the task.
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    /// A channel number already has a reader on this connection.
    #[error("Channel {0} is already open")]
    ChannelInUse(u16),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error (configuration loading).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl TaskwireError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_)
            | Self::Tls(_)
            | Self::MalformedFrame(_)
            | Self::ConnectionClosed
            | Self::HeartbeatTimeout
            | Self::BackpressureTimeout => ErrorKind::Transport,
            Self::Protocol(_) | Self::UnexpectedMessageType { .. } | Self::Deserialization { .. } => {
                ErrorKind::Protocol
            }
            Self::Invokation { .. } | Self::General { .. } => ErrorKind::Execution,
            Self::NoAvailableRunner(_)
            | Self::RetriesExhausted { .. }
            | Self::TimedOut
            | Self::Cancelled(_) => ErrorKind::Policy,
            Self::ChannelInUse(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::MsgPackEncode(_)
            | Self::MsgPackDecode(_) => ErrorKind::Local,
        }
    }

    /// Whether the task client may resubmit after this error.
    ///
    /// Transport failures and an empty runner pool are retried; everything
    /// else is surfaced as is, since the work may already have run.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport || matches!(self, Self::NoAvailableRunner(_))
    }

    /// Shorthand for a deserialization failure without inner detail.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
            detail: None,
        }
    }
}

/// Result type alias using TaskwireError.
pub type Result<T> = std::result::Result<T, TaskwireError>;
