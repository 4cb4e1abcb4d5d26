//! # Connection Multiplexer
//!
//! Purpose: Spread many logical callers over a small, fixed set of physical
//! connections, each owned by a `PhysicalBridge`.
//!
//! ## Design Principles
//! 1. **Fixed Fan-Out**: Bridges are created once at connect time; a dropped
//!    socket is re-established behind the same bridge instead of replaced.
//! 2. **Round-Robin, Connected First**: Selection rotates over bridges and
//!    skips ones that are down while any other is up.
//! 3. **Owned Background Work**: Writer and connection tasks live as long as
//!    the multiplexer; shutdown (or drop) stops them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use muxkv_common::{ClientError, ClientResult, MuxConfig};

use crate::bridge::{BridgeConfig, BridgeStatus, PhysicalBridge};
use crate::message::{Message, PendingReply};
use crate::tcp::{run_connection, TcpSettings};

struct MuxInner {
    config: MuxConfig,
    bridges: Vec<PhysicalBridge>,
    next: AtomicUsize,
    runtime: Handle,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a set of multiplexed physical connections.
///
/// Cloning is cheap; the connections close when the last clone is dropped or
/// `shutdown` is called.
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    inner: Arc<MuxInner>,
}

impl ConnectionMultiplexer {
    /// Validates `config` and starts one writer and one connection task per
    /// physical connection.
    ///
    /// Must be called from within a Tokio runtime. Returns before any socket
    /// is up; messages sent meanwhile follow the backlog policy.
    pub fn connect(config: MuxConfig) -> ClientResult<Self> {
        config.validate()?;
        let addr: SocketAddr = config.addr.parse().map_err(|_| ClientError::InvalidAddress)?;
        let runtime = Handle::try_current()
            .map_err(|_| ClientError::Runtime("no Tokio runtime is running".to_string()))?;

        let bridge_config = BridgeConfig::from(&config);
        let settings = TcpSettings {
            addr,
            connect_timeout: config.connect_timeout(),
            reconnect_interval: config.reconnect_interval(),
        };
        let shutdown = CancellationToken::new();
        let mut bridges = Vec::with_capacity(config.connections);
        let mut tasks = Vec::with_capacity(config.connections * 2);
        for id in 0..config.connections {
            let bridge = PhysicalBridge::new(id, bridge_config.clone());
            tasks.push(bridge.start_writer());
            tasks.push(runtime.spawn(run_connection(
                bridge.clone(),
                settings.clone(),
                shutdown.clone(),
            )));
            bridges.push(bridge);
        }
        info!(
            addr = %addr,
            connections = config.connections,
            policy = ?config.backlog_policy,
            "multiplexer started"
        );

        Ok(ConnectionMultiplexer {
            inner: Arc::new(MuxInner {
                config,
                bridges,
                next: AtomicUsize::new(0),
                runtime,
                shutdown,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Runtime the connection and writer tasks run on.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn bridges(&self) -> &[PhysicalBridge] {
        &self.inner.bridges
    }

    /// Picks the next bridge in rotation, preferring connected ones.
    pub fn select(&self) -> &PhysicalBridge {
        let bridges = &self.inner.bridges;
        let start = self.inner.next.fetch_add(1, Ordering::Relaxed) % bridges.len();
        (0..bridges.len())
            .map(|offset| &bridges[(start + offset) % bridges.len()])
            .find(|bridge| bridge.is_connected())
            .unwrap_or(&bridges[start])
    }

    /// Submits a message from an async caller.
    pub fn send(&self, message: Message) -> PendingReply {
        self.select().enqueue_or_send(message)
    }

    /// Submits a message from a blocking caller; may wait for the write path.
    pub fn send_blocking(&self, message: Message) -> PendingReply {
        self.select().send_blocking(message.blocking())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.bridges.iter().any(PhysicalBridge::is_connected)
    }

    pub fn status(&self) -> Vec<BridgeStatus> {
        self.inner.bridges.iter().map(PhysicalBridge::status).collect()
    }

    /// Closes every connection and fails all queued and in-flight messages.
    pub fn shutdown(&self) {
        self.inner.stop();
    }
}

impl MuxInner {
    fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for bridge in &self.bridges {
            bridge.shutdown();
        }
        // Tasks observe the signals and exit on their own.
        self.tasks.lock().clear();
        info!("multiplexer shut down");
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        self.stop();
    }
}
