//! # MuxKV Multiplexing Client
//!
//! Purpose: Provide a Redis-compatible client that shares a few physical
//! connections among many callers, serializing writes per connection and
//! queueing messages while a connection is unavailable.
//!
//! ## Design Principles
//! 1. **Exclusive Writes**: Each connection has one `ExclusiveMutex`; only its
//!    holder may write, so frames never interleave.
//! 2. **Backlog over Blocking**: Callers that cannot write right away hand the
//!    message to the connection's backlog and return; a writer task drains it.
//! 3. **Typed Failure**: Timeouts, connection loss and fail-fast rejections are
//!    distinct `SendError` values delivered to the affected caller only.
//! 4. **Async and Blocking**: Every operation has a future and a blocking form
//!    over the same state machine.

pub mod lock;

mod backlog;
mod bridge;
mod client;
mod message;
mod multiplexer;
mod tcp;
mod transport;

pub use bridge::{BridgeConfig, BridgeStatus, PhysicalBridge};
pub use client::{ClientTtl, KVClient};
pub use lock::{
    AwaitableLockToken, ExclusiveMutex, LockCanceled, LockOutcome, LockState, LockToken,
};
pub use message::{Message, Origin, PendingReply};
pub use multiplexer::ConnectionMultiplexer;
pub use transport::Transport;

pub use tokio_util::sync::CancellationToken;

pub use muxkv_common::{
    BacklogPolicy, ClientError, ClientResult, ConfigError, MuxConfig, ProtocolError, RespValue,
    SendError, TransportError,
};
