//! # Physical Bridge
//!
//! Purpose: Own everything about one physical connection's outbound side: the
//! write lock, the backlog, the in-flight replies, and the writer task that
//! drains the backlog once the connection is writable.
//!
//! ## Design Principles
//! 1. **Direct When Possible**: A message goes straight to the transport when
//!    the connection is up, the write lock is free without waiting, and the
//!    backlog is empty. Everything else goes through the backlog.
//! 2. **Single Writer**: Every write, direct or drained, happens under the
//!    connection's `ExclusiveMutex`, so frames never interleave on the wire.
//! 3. **Background Drain**: Replaying the backlog runs on the writer task, never
//!    on a caller's thread.
//! 4. **Per-Caller Failure**: Expiry and connection loss fail individual
//!    messages; the bridge itself keeps running.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► start_writer ──► on_connection_restored ◄──► on_connection_lost
//!                                    │                        │
//!                                    └──── drain backlog ─────┘
//!                                                             ▼
//!                                                         shutdown
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use muxkv_common::{BacklogPolicy, MuxConfig, RespValue, SendError, TransportError};

use crate::backlog::{Backlog, BacklogEntry};
use crate::lock::{ExclusiveMutex, LockToken};
use crate::message::{Message, Origin, PendingReply, ReplySender};
use crate::transport::Transport;

/// Per-connection settings, derived from `MuxConfig`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub backlog_policy: BacklogPolicy,
    pub write_lock_timeout: Duration,
    pub sync_timeout: Duration,
    pub async_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&MuxConfig> for BridgeConfig {
    fn from(config: &MuxConfig) -> Self {
        BridgeConfig {
            backlog_policy: config.backlog_policy,
            write_lock_timeout: config.write_lock_timeout(),
            sync_timeout: config.sync_timeout(),
            async_timeout: config.async_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig::from(&MuxConfig::default())
    }
}

/// Read-only snapshot of a bridge, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub id: usize,
    pub connected: bool,
    /// Messages currently waiting in the backlog.
    pub backlog_pending: usize,
    /// Messages ever admitted to the backlog.
    pub total_backlog_queued: u64,
    /// Whether the writer task is draining right now.
    pub writer_active: bool,
    /// Whether the write lock is held.
    pub write_lock_held: bool,
    /// Written messages still waiting for a reply.
    pub in_flight: usize,
    /// Messages handed to the transport.
    pub messages_sent: u64,
}

/// How a drain pass under the write lock ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainStop {
    /// Backlog is empty.
    Empty,
    /// Another caller is queued for the write lock.
    Yielded,
    /// The connection cannot take writes.
    NotWritable,
}

struct BridgeInner {
    id: usize,
    config: BridgeConfig,
    write_lock: ExclusiveMutex,
    backlog: Backlog,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    // Completions of written messages, in wire order.
    in_flight: Mutex<VecDeque<ReplySender>>,
    ever_connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    writer_active: AtomicBool,
    messages_sent: AtomicU64,
    drain_requested: Notify,
    shutdown: CancellationToken,
}

/// Outbound half of one physical connection.
///
/// Cloning is cheap; all clones share the same connection state.
#[derive(Clone)]
pub struct PhysicalBridge {
    inner: Arc<BridgeInner>,
}

impl PhysicalBridge {
    pub fn new(id: usize, config: BridgeConfig) -> Self {
        let write_lock = ExclusiveMutex::new(config.write_lock_timeout);
        PhysicalBridge {
            inner: Arc::new(BridgeInner {
                id,
                config,
                write_lock,
                backlog: Backlog::new(),
                transport: RwLock::new(None),
                in_flight: Mutex::new(VecDeque::new()),
                ever_connected: AtomicBool::new(false),
                last_error: Mutex::new(None),
                writer_active: AtomicBool::new(false),
                messages_sent: AtomicU64::new(0),
                drain_requested: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// The lock serializing writes to this connection.
    pub fn write_lock(&self) -> &ExclusiveMutex {
        &self.inner.write_lock
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.read().is_some()
    }

    /// Spawns the writer task on the current Tokio runtime.
    pub fn start_writer(&self) -> JoinHandle<()> {
        tokio::spawn(run_writer(Arc::clone(&self.inner)))
    }

    /// Admits a message: writes it now if the connection is free, otherwise
    /// queues or rejects it according to the backlog policy.
    pub fn enqueue_or_send(&self, message: Message) -> PendingReply {
        let (completion, pending) = PendingReply::channel();
        self.inner.admit(message, completion, Duration::ZERO);
        pending
    }

    /// Like `enqueue_or_send`, but blocks up to the write-lock timeout for the
    /// write path when another writer holds it. A draining writer yields to
    /// callers blocked here.
    pub fn send_blocking(&self, message: Message) -> PendingReply {
        let (completion, pending) = PendingReply::channel();
        let wait = self.inner.config.write_lock_timeout;
        self.inner.admit(message, completion, wait);
        pending
    }

    /// Marks the connection writable through `transport` and wakes the writer
    /// to replay the backlog.
    pub fn on_connection_restored(&self, transport: Arc<dyn Transport>) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        *self.inner.transport.write() = Some(transport);
        self.inner.ever_connected.store(true, Ordering::Release);
        info!(
            connection = self.inner.id,
            pending = self.inner.backlog.len(),
            "connection restored"
        );
        self.inner.drain_requested.notify_one();
    }

    /// Marks the connection unwritable. Queued messages stay queued; written
    /// messages still awaiting a reply fail with `ConnectionLost`.
    pub fn on_connection_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let had_transport = self.inner.transport.write().take().is_some();
        *self.inner.last_error.lock() = Some(reason.clone());

        let orphaned: Vec<_> = self.inner.in_flight.lock().drain(..).collect();
        if had_transport || !orphaned.is_empty() {
            warn!(
                connection = self.inner.id,
                in_flight = orphaned.len(),
                pending = self.inner.backlog.len(),
                %reason,
                "connection lost"
            );
        }
        for completion in orphaned {
            let _ = completion.send(Err(SendError::ConnectionLost {
                reason: reason.clone(),
            }));
        }
    }

    /// Records why a connection attempt failed, for later backlog errors.
    pub fn record_connect_failure(&self, reason: impl Into<String>) {
        *self.inner.last_error.lock() = Some(reason.into());
    }

    /// Completes the oldest in-flight message with `reply`.
    pub fn on_reply(&self, reply: RespValue) {
        match self.inner.in_flight.lock().pop_front() {
            Some(completion) => {
                let _ = completion.send(Ok(reply));
            }
            None => warn!(connection = self.inner.id, "reply without a pending request"),
        }
    }

    /// Stops the writer and fails everything still queued or in flight.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.transport.write().take();
        fail_dropped(self.inner.backlog.take_all().into_iter().map(|e| e.completion));
        let orphaned: Vec<_> = self.inner.in_flight.lock().drain(..).collect();
        fail_dropped(orphaned);
        debug!(connection = self.inner.id, "bridge shut down");
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            id: self.inner.id,
            connected: self.is_connected(),
            backlog_pending: self.inner.backlog.len(),
            total_backlog_queued: self.inner.backlog.total_queued(),
            writer_active: self.inner.writer_active.load(Ordering::Acquire),
            write_lock_held: self.inner.write_lock.is_held(),
            in_flight: self.inner.in_flight.lock().len(),
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
        }
    }
}

impl BridgeInner {
    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    /// Admission logic shared by both surfaces; `wait` bounds the blocking
    /// wait for the write lock (zero = only if free).
    fn admit(&self, message: Message, completion: ReplySender, wait: Duration) {
        if self.shutdown.is_cancelled() {
            let _ = completion.send(Err(SendError::Dropped));
            return;
        }
        let timeout = message.timeout().unwrap_or(match message.origin() {
            Origin::Async => self.config.async_timeout,
            Origin::Sync => self.config.sync_timeout,
        });
        let payload = message.into_payload();

        let completion = match self.try_write_direct(&payload, completion, wait) {
            Some(completion) => completion,
            None => return,
        };

        let connected = self.transport.read().is_some();
        if !connected && self.config.backlog_policy == BacklogPolicy::FailFast {
            let last_error = self.last_error.lock().clone();
            trace!(connection = self.id, "rejecting message: no connection");
            let _ = completion.send(Err(SendError::NoConnectionAvailable { last_error }));
            return;
        }
        self.enqueue(BacklogEntry::new(payload, completion, timeout), connected);
    }

    /// Writes immediately when the connection is up and the write path can be
    /// had within `wait`. Returns the completion when nothing was written.
    fn try_write_direct(
        &self,
        payload: &Bytes,
        completion: ReplySender,
        wait: Duration,
    ) -> Option<ReplySender> {
        // Only a caller that waited for the write path may overtake the backlog.
        let may_overtake = !wait.is_zero();
        if self.transport.read().is_none() || (!may_overtake && !self.backlog.is_empty()) {
            return Some(completion);
        }
        let token = self.write_lock.try_acquire_sync(Some(wait));
        if !token.success() || (!may_overtake && !self.backlog.is_empty()) {
            return Some(completion);
        }
        match self.current_transport() {
            Some(transport) => self
                .write_locked(&token, &transport, payload.clone(), completion)
                .err(),
            None => Some(completion),
        }
    }

    fn enqueue(&self, entry: BacklogEntry, connected: bool) {
        self.backlog.push(entry);
        trace!(connection = self.id, pending = self.backlog.len(), "message backlogged");
        if self.shutdown.is_cancelled() {
            // Shutdown already emptied the backlog; fail what raced past it.
            fail_dropped(self.backlog.take_all().into_iter().map(|e| e.completion));
            return;
        }
        if connected {
            self.drain_requested.notify_one();
        }
    }

    /// Hands `payload` to the transport. The caller holds the write lock,
    /// which `_token` witnesses.
    ///
    /// When the connection turns out to be gone the completion comes back so
    /// the message can be requeued; any other transport failure is delivered
    /// to the caller.
    fn write_locked(
        &self,
        _token: &LockToken,
        transport: &Arc<dyn Transport>,
        payload: Bytes,
        completion: ReplySender,
    ) -> Result<(), ReplySender> {
        // Register before writing so a fast reply always finds its caller.
        self.in_flight.lock().push_back(completion);
        let err = match transport.write_to_socket(payload) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                if self.shutdown.is_cancelled() {
                    let orphaned: Vec<_> = self.in_flight.lock().drain(..).collect();
                    fail_dropped(orphaned);
                }
                return Ok(());
            }
            Err(err) => err,
        };

        debug!(connection = self.id, error = %err, "transport rejected write");
        *self.last_error.lock() = Some(err.to_string());
        // Writes are serialized, so the tail is the entry just pushed.
        let completion = match self.in_flight.lock().pop_back() {
            Some(completion) => completion,
            // Connection loss already failed it.
            None => return Ok(()),
        };
        match err {
            TransportError::NotConnected | TransportError::Closed => {
                // Only forget the transport that failed; a reconnect may have
                // installed a newer one meanwhile.
                let mut slot = self.transport.write();
                if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, transport)) {
                    slot.take();
                }
                Err(completion)
            }
            err => {
                let _ = completion.send(Err(SendError::Transport(err)));
                Ok(())
            }
        }
    }

    fn backlog_timeout(&self, entry: &BacklogEntry, now: Instant) -> SendError {
        SendError::BacklogTimeout {
            waited: entry.waited(now),
            ever_connected: self.ever_connected.load(Ordering::Acquire),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn fail_expired(&self, entry: BacklogEntry, now: Instant) {
        let err = self.backlog_timeout(&entry, now);
        warn!(
            connection = self.id,
            waited_ms = entry.waited(now).as_millis() as u64,
            "backlogged message timed out"
        );
        let _ = entry.completion.send(Err(err));
    }

    /// Fails expired entries without writing anything. Caller holds the lock.
    fn sweep_expired(&self, _token: &LockToken) {
        let now = Instant::now();
        for entry in self.backlog.take_expired(now) {
            self.fail_expired(entry, now);
        }
    }

    /// Writes backlog entries head to tail while holding the write lock.
    fn drain_locked(&self, token: &LockToken) -> DrainStop {
        loop {
            let transport = match self.current_transport() {
                Some(transport) => transport,
                None => {
                    self.sweep_expired(token);
                    return DrainStop::NotWritable;
                }
            };
            let entry = match self.backlog.pop_front() {
                Some(entry) => entry,
                None => return DrainStop::Empty,
            };
            let now = Instant::now();
            if entry.is_expired(now) {
                self.fail_expired(entry, now);
                continue;
            }

            let BacklogEntry {
                payload,
                completion,
                enqueued_at,
                deadline,
            } = entry;
            if let Err(completion) =
                self.write_locked(token, &transport, payload.clone(), completion)
            {
                self.backlog.requeue(BacklogEntry {
                    payload,
                    completion,
                    enqueued_at,
                    deadline,
                });
                return DrainStop::NotWritable;
            }

            if self.write_lock.has_waiters() {
                return DrainStop::Yielded;
            }
        }
    }

    /// Acquires the write lock and drains until the backlog is empty or the
    /// connection goes away, stepping aside for queued writers.
    async fn drain(&self) {
        while !self.backlog.is_empty() {
            let token = match self.write_lock.try_acquire_async(Some(&self.shutdown)).await {
                Ok(token) if token.success() => token,
                Ok(_) => {
                    // Write path stayed busy for the whole lock timeout; the
                    // next trigger or heartbeat retries.
                    trace!(connection = self.id, "drain could not take the write lock");
                    return;
                }
                Err(_) => return,
            };

            self.writer_active.store(true, Ordering::Release);
            let started = self.backlog.len();
            let stop = self.drain_locked(&token);
            self.writer_active.store(false, Ordering::Release);
            drop(token);
            debug!(
                connection = self.id,
                started,
                remaining = self.backlog.len(),
                ?stop,
                "drain pass finished"
            );

            match stop {
                DrainStop::Empty => {}
                DrainStop::Yielded => tokio::task::yield_now().await,
                DrainStop::NotWritable => return,
            }
        }
    }
}

fn fail_dropped(completions: impl IntoIterator<Item = ReplySender>) {
    for completion in completions {
        let _ = completion.send(Err(SendError::Dropped));
    }
}

/// Writer loop: drains on request and sweeps expired entries on every
/// heartbeat, until the bridge shuts down.
async fn run_writer(inner: Arc<BridgeInner>) {
    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.drain_requested.notified() => {}
            _ = heartbeat.tick() => {}
        }
        if inner.shutdown.is_cancelled() {
            break;
        }

        inner.drain().await;

        // Disconnected backlogs are never drained, so expire them here.
        if !inner.backlog.is_empty() {
            let token = inner.write_lock.try_acquire_sync(Some(Duration::ZERO));
            if token.success() {
                inner.sweep_expired(&token);
            }
        }
    }
    debug!(connection = inner.id, "writer stopped");
}
