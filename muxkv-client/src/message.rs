//! # Outbound Messages
//!
//! Purpose: Carry an encoded command to a connection and hand its reply back
//! to exactly one caller.
//!
//! ## Design Principles
//! 1. **Encode Once**: The payload is framed up front into `Bytes`, so requeueing
//!    or retrying a write only bumps a reference count.
//! 2. **One Completion**: Each message owns a oneshot sender; whoever finishes
//!    the message (reply, expiry, connection loss) consumes it.
//! 3. **Dual Surface**: `PendingReply` is a future for async callers and has a
//!    blocking `wait` for threads.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use muxkv_common::{encode_command, RespValue, SendError};

pub(crate) type ReplySender = oneshot::Sender<Result<RespValue, SendError>>;

/// Which deadline applies to a message that has to wait in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Submitted by an async caller; uses the async timeout.
    Async,
    /// Submitted by a blocking caller; uses the sync timeout.
    Sync,
}

/// An encoded command ready to be written to a connection.
#[derive(Debug, Clone)]
pub struct Message {
    payload: Bytes,
    timeout: Option<Duration>,
    origin: Origin,
}

impl Message {
    /// Wraps an already-encoded payload.
    pub fn from_bytes(payload: Bytes) -> Self {
        Message {
            payload,
            timeout: None,
            origin: Origin::Async,
        }
    }

    /// Encodes `args` as a RESP2 command.
    pub fn command<A: AsRef<[u8]>>(args: &[A]) -> Self {
        let mut buf = BytesMut::new();
        encode_command(args, &mut buf);
        Message::from_bytes(buf.freeze())
    }

    /// Overrides the backlog deadline for this message.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the message as submitted by a blocking caller.
    pub fn blocking(mut self) -> Self {
        self.origin = Origin::Sync;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub(crate) fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Completion of a submitted message.
///
/// Resolves with the server reply, or with the `SendError` that ended the
/// message. Dropping it does not withdraw the message.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<RespValue, SendError>>,
}

impl PendingReply {
    pub(crate) fn channel() -> (ReplySender, PendingReply) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingReply { rx })
    }

    /// Blocks the current thread until the message completes.
    ///
    /// Must not be called from inside an async context; use `.await` there.
    pub fn wait(self) -> Result<RespValue, SendError> {
        self.rx.blocking_recv().unwrap_or(Err(SendError::Dropped))
    }

    /// Like `wait`, but gives up after `limit` with `ReplyTimeout`. The timer
    /// is driven by `runtime`, which must be a multi-thread runtime.
    pub fn wait_timeout(self, runtime: &Handle, limit: Duration) -> Result<RespValue, SendError> {
        let started = Instant::now();
        runtime
            .block_on(tokio::time::timeout(limit, self))
            .unwrap_or_else(|_| {
                Err(SendError::ReplyTimeout {
                    waited: started.elapsed(),
                })
            })
    }

    /// Returns the outcome if the message already completed.
    pub fn try_result(&mut self) -> Option<Result<RespValue, SendError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SendError::Dropped)),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<RespValue, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SendError::Dropped)))
    }
}
