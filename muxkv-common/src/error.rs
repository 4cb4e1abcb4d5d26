//! # Error Taxonomy
//!
//! Purpose: Give every failure a caller can observe a distinct, typed shape.
//!
//! ## Design Principles
//! 1. **Values, Not Panics**: Contention timeouts are not errors at all; they
//!    surface as unsuccessful lock tokens. Everything here is a real failure.
//! 2. **Per-Caller Delivery**: A `SendError` belongs to exactly one message and
//!    never poisons the shared connection state.
//! 3. **Enough Context**: Backlog failures carry the last connection error so
//!    "never connected" and "connected, then failed" can be told apart.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a transport when bytes cannot reach the socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has no live socket.
    #[error("transport is not connected")]
    NotConnected,
    /// The transport has been shut down for good.
    #[error("transport closed")]
    Closed,
    /// Underlying socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// RESP2 framing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Unknown type marker at the start of a frame.
    #[error("unexpected type marker {0:#04x}")]
    UnexpectedMarker(u8),
    /// A line was not terminated by CRLF.
    #[error("missing CRLF terminator")]
    MissingCrlf,
    /// A length or integer field could not be parsed.
    #[error("invalid integer field")]
    InvalidInteger,
}

/// Failures delivered to the caller that submitted a message.
#[derive(Debug, Error)]
pub enum SendError {
    /// Fail-fast policy and the connection cannot accept writes.
    #[error("no connection is available{}", describe_last(.last_error))]
    NoConnectionAvailable { last_error: Option<String> },
    /// The message sat in the backlog past its deadline without being written.
    #[error("{}", describe_backlog_timeout(.waited, .ever_connected, .last_error))]
    BacklogTimeout {
        waited: Duration,
        ever_connected: bool,
        last_error: Option<String>,
    },
    /// The message was written but the connection dropped before the reply.
    #[error("connection lost before a reply arrived: {reason}")]
    ConnectionLost { reason: String },
    /// A blocking caller gave up waiting for the reply.
    #[error("no reply within {}ms", .waited.as_millis())]
    ReplyTimeout { waited: Duration },
    /// The transport failed the write for a reason other than a lost socket.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The completion was abandoned, usually during shutdown.
    #[error("message dropped before completion")]
    Dropped,
}

fn describe_backlog_timeout(
    waited: &Duration,
    ever_connected: &bool,
    last_error: &Option<String>,
) -> String {
    let cause = if *ever_connected {
        "connection was lost"
    } else {
        "never connected"
    };
    format!(
        "timed out after {}ms while in the backlog ({}){}",
        waited.as_millis(),
        cause,
        describe_last(last_error)
    )
}

fn describe_last(last_error: &Option<String>) -> String {
    match last_error {
        Some(reason) => format!("; last connection error: {}", reason),
        None => String::new(),
    }
}

/// Configuration rejected by `MuxConfig::validate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("addr must not be empty")]
    EmptyAddress,
    #[error("connections must be at least 1")]
    NoConnections,
    #[error("heartbeat_interval_ms must be positive")]
    ZeroHeartbeat,
}

/// Errors surfaced by the high-level client facade.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The message could not be delivered or answered.
    #[error(transparent)]
    Send(#[from] SendError),
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,
    /// Configuration was rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// No Tokio runtime was available or one could not be started.
    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

/// Result type for the client facade.
pub type ClientResult<T> = Result<T, ClientError>;
