//! # TCP Transport
//!
//! Purpose: Keep one physical TCP connection alive for a `PhysicalBridge`:
//! connect, feed written bytes to the socket, decode replies, and reconnect
//! after a fixed delay when the socket dies.
//!
//! ## Design Principles
//! 1. **Non-Blocking Writes**: `write_to_socket` only pushes `Bytes` onto a
//!    channel; a socket task performs the actual I/O.
//! 2. **Connection Epochs**: Each connect creates a fresh `TcpTransport`; once
//!    that socket ends, writes through the old transport fail with
//!    `NotConnected` instead of reaching a newer socket.
//! 3. **Fixed Reconnect Delay**: No command retries happen here; queued work
//!    is replayed by the bridge once the connection is restored.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use muxkv_common::{RespDecoder, TransportError};

use crate::bridge::PhysicalBridge;
use crate::transport::Transport;

/// Writable handle to one live TCP socket.
pub(crate) struct TcpTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl Transport for TcpTransport {
    fn write_to_socket(&self, raw: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(raw)
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Settings for the connection task.
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub addr: SocketAddr,
    pub connect_timeout: Option<Duration>,
    pub reconnect_interval: Duration,
}

/// Connects, serves, and reconnects until `shutdown` is canceled.
pub async fn run_connection(
    bridge: PhysicalBridge,
    settings: TcpSettings,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match connect(&settings).await {
            Ok(stream) => {
                info!(connection = bridge.id(), addr = %settings.addr, "connected");
                let (reader, writer) = stream.into_split();
                let (outbound, queued) = mpsc::unbounded_channel();
                bridge.on_connection_restored(Arc::new(TcpTransport { outbound }));
                let reason = serve(&bridge, reader, writer, queued, &shutdown).await;
                bridge.on_connection_lost(reason);
            }
            Err(err) => {
                debug!(connection = bridge.id(), error = %err, "connect failed");
                bridge.record_connect_failure(err.to_string());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.reconnect_interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    debug!(connection = bridge.id(), "connection task stopped");
}

async fn connect(settings: &TcpSettings) -> io::Result<TcpStream> {
    let stream = match settings.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(settings.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => TcpStream::connect(settings.addr).await?,
    };
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Runs one socket until it fails or shutdown; returns the reason it ended.
async fn serve(
    bridge: &PhysicalBridge,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    queued: mpsc::UnboundedReceiver<Bytes>,
    shutdown: &CancellationToken,
) -> String {
    tokio::select! {
        result = write_loop(writer, queued) => match result {
            Ok(()) => "transport replaced".to_string(),
            Err(err) => format!("write failed: {}", err),
        },
        err = read_loop(bridge, reader) => format!("read failed: {}", err),
        _ = shutdown.cancelled() => "shutting down".to_string(),
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    while let Some(chunk) = queued.recv().await {
        writer.write_all(&chunk).await?;
        // Coalesce whatever else is already queued before the next await.
        while let Ok(more) = queued.try_recv() {
            writer.write_all(&more).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}

async fn read_loop(bridge: &PhysicalBridge, mut reader: OwnedReadHalf) -> io::Error {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut decoder = RespDecoder::new();
    loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                return io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection")
            }
            Ok(_) => {}
            Err(err) => return err,
        }
        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(reply)) => bridge.on_reply(reply),
                Ok(None) => break,
                Err(err) => return io::Error::new(io::ErrorKind::InvalidData, err),
            }
        }
    }
}
