//! Error types for the connection layer.
//!
//! `ConnError` is the single error type surfaced by the registry, the
//! dispatcher and the request-side API. Each variant has a stable numeric
//! status so it can travel back to a client inside an error packet.

use crate::ha::HaState;
use std::fmt;

/// Errors raised by connection, dispatch and worker operations.
#[derive(Debug)]
pub enum ConnError {
    /// The peer went away, the header could not be read, or the handle is stale
    ConnectionClosed,
    /// Admission denied for the client's class
    ClientsExceeded,
    /// No free connection slot
    PoolExhausted,
    /// A payload could not be buffered; its bytes were drained
    CannotAllocateBuffer { request_id: u16 },
    /// Unknown packet type in a header
    WrongPacketType(u32),
    /// Nothing queued for the request, or the wait was interrupted
    NoDataAvailable,
    /// A bounded wait elapsed
    TimedOut,
    /// An internal bookkeeping invariant does not hold
    InternalInconsistency(String),
    /// The server refused the request (HA fail-back, shutdown)
    RequestRefused,
    /// An HA role change was not permitted from the current state
    HaStateChangeRejected { current: HaState, requested: HaState },
    /// Malformed frame contents
    Protocol(String),
    /// Underlying transport error
    Io(std::io::Error),
}

impl ConnError {
    /// Numeric status carried in the `error_code` field of error packets.
    pub fn status_code(&self) -> i32 {
        match self {
            ConnError::ConnectionClosed => -1,
            ConnError::ClientsExceeded => -2,
            ConnError::PoolExhausted => -3,
            ConnError::CannotAllocateBuffer { .. } => -4,
            ConnError::WrongPacketType(_) => -5,
            ConnError::NoDataAvailable => -6,
            ConnError::TimedOut => -7,
            ConnError::InternalInconsistency(_) => -8,
            ConnError::RequestRefused => -9,
            ConnError::HaStateChangeRejected { .. } => -10,
            ConnError::Protocol(_) => -11,
            ConnError::Io(_) => -12,
        }
    }

    /// True for errors after which the connection cannot be used again.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            ConnError::ConnectionClosed
                | ConnError::WrongPacketType(_)
                | ConnError::Protocol(_)
                | ConnError::Io(_)
        )
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::ConnectionClosed => write!(f, "connection closed"),
            ConnError::ClientsExceeded => write!(f, "maximum number of clients exceeded"),
            ConnError::PoolExhausted => write!(f, "no free connection entry"),
            ConnError::CannotAllocateBuffer { request_id } => {
                write!(f, "cannot allocate buffer for request {}", request_id)
            }
            ConnError::WrongPacketType(t) => write!(f, "wrong packet type {}", t),
            ConnError::NoDataAvailable => write!(f, "no data available"),
            ConnError::TimedOut => write!(f, "timed out"),
            ConnError::InternalInconsistency(msg) => write!(f, "internal inconsistency: {}", msg),
            ConnError::RequestRefused => write!(f, "request refused"),
            ConnError::HaStateChangeRejected { current, requested } => write!(
                f,
                "HA state change from {} to {} rejected",
                current, requested
            ),
            ConnError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ConnError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => ConnError::ConnectionClosed,
            _ => ConnError::Io(e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ConnError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ConnError::TimedOut
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {}", e),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
