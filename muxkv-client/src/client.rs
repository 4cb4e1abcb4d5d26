//! # Client API
//!
//! Purpose: Expose a compact API for issuing Redis-compatible commands over the
//! multiplexed connections, both as futures and as blocking calls.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides bridges, backlogs, and RESP framing.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **One Parser per Command**: Async and blocking variants share the reply
//!    mapping, so both surfaces agree on every edge case.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use muxkv_common::{ClientError, ClientResult, MuxConfig, RespValue};

use crate::bridge::BridgeStatus;
use crate::message::Message;
use crate::multiplexer::ConnectionMultiplexer;

/// Heartbeats a blocking caller waits past the sync timeout; backlog expiry is
/// only noticed on a heartbeat.
const REPLY_GRACE_HEARTBEATS: u32 = 2;

/// Lower bound on that grace period.
const MIN_REPLY_GRACE: Duration = Duration::from_millis(100);

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Multiplexing client.
///
/// Every call encodes one command, hands it to a physical connection (or its
/// backlog), and waits for the matching reply. Blocking variants must not be
/// called from inside an async context.
pub struct KVClient {
    mux: ConnectionMultiplexer,
    runtime: Option<Runtime>,
}

impl KVClient {
    /// Starts a client on the current Tokio runtime.
    pub fn connect(config: MuxConfig) -> ClientResult<Self> {
        Ok(KVClient {
            mux: ConnectionMultiplexer::connect(config)?,
            runtime: None,
        })
    }

    /// Starts a client for blocking use, with its own background runtime.
    pub fn connect_blocking(config: MuxConfig) -> ClientResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("muxkv-io")
            .enable_all()
            .build()
            .map_err(|err| ClientError::Runtime(format!("failed to start runtime: {}", err)))?;
        let mux = {
            let _entered = runtime.enter();
            ConnectionMultiplexer::connect(config)?
        };
        Ok(KVClient {
            mux,
            runtime: Some(runtime),
        })
    }

    pub fn multiplexer(&self) -> &ConnectionMultiplexer {
        &self.mux
    }

    /// Sends an arbitrary command and returns its reply.
    ///
    /// Error replies surface as `ClientError::Server`.
    pub async fn execute(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let reply = self.mux.send(Message::command(args)).await?;
        server_reply(reply)
    }

    /// Blocking form of `execute`.
    ///
    /// Waits at most the sync timeout plus a short grace for the reply, so a
    /// backlogged message still reports its own `BacklogTimeout` first.
    pub fn execute_blocking(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let config = self.mux.config();
        let grace = (config.heartbeat_interval() * REPLY_GRACE_HEARTBEATS).max(MIN_REPLY_GRACE);
        let limit = config.sync_timeout() + grace;
        let reply = self
            .mux
            .send_blocking(Message::command(args))
            .wait_timeout(self.mux.runtime(), limit)?;
        server_reply(reply)
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        parse_get(self.execute(&[b"GET", key]).await?)
    }

    pub fn get_blocking(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        parse_get(self.execute_blocking(&[b"GET", key])?)
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        parse_ok(self.execute(&[b"SET", key, value]).await?)
    }

    pub fn set_blocking(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        parse_ok(self.execute_blocking(&[b"SET", key, value])?)
    }

    /// Sets a value and attaches an expiration in seconds.
    pub async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        parse_ok(self.execute(&[b"SET", key, value, b"EX", &seconds[..len]]).await?)
    }

    pub fn set_with_ttl_blocking(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> ClientResult<()> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        parse_ok(self.execute_blocking(&[b"SET", key, value, b"EX", &seconds[..len]])?)
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        parse_count(self.execute(&[b"DEL", key]).await?)
    }

    pub fn delete_blocking(&self, key: &[u8]) -> ClientResult<bool> {
        parse_count(self.execute_blocking(&[b"DEL", key])?)
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub async fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        parse_count(self.execute(&[b"EXPIRE", key, &seconds[..len]]).await?)
    }

    pub fn expire_blocking(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        parse_count(self.execute_blocking(&[b"EXPIRE", key, &seconds[..len]])?)
    }

    /// Returns TTL status for a key.
    pub async fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        parse_ttl(self.execute(&[b"TTL", key]).await?)
    }

    pub fn ttl_blocking(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        parse_ttl(self.execute_blocking(&[b"TTL", key])?)
    }

    /// Pings the server. Returns the raw response payload.
    pub async fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let reply = match payload {
            Some(data) => self.execute(&[b"PING", data]).await?,
            None => self.execute(&[b"PING"]).await?,
        };
        parse_text(reply)
    }

    pub fn ping_blocking(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let reply = match payload {
            Some(data) => self.execute_blocking(&[b"PING", data])?,
            None => self.execute_blocking(&[b"PING"])?,
        };
        parse_text(reply)
    }

    /// Fetches server INFO output.
    pub async fn info(&self) -> ClientResult<Vec<u8>> {
        parse_bulk(self.execute(&[b"INFO"]).await?)
    }

    pub fn info_blocking(&self) -> ClientResult<Vec<u8>> {
        parse_bulk(self.execute_blocking(&[b"INFO"])?)
    }

    /// Per-connection diagnostics.
    pub fn status(&self) -> Vec<BridgeStatus> {
        self.mux.status()
    }

    /// Closes all connections; pending calls fail with `SendError::Dropped`.
    pub fn shutdown(&self) {
        self.mux.shutdown();
    }
}

impl Drop for KVClient {
    fn drop(&mut self) {
        self.mux.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn server_reply(reply: RespValue) -> ClientResult<RespValue> {
    match reply {
        RespValue::Error(message) => Err(ClientError::Server { message }),
        other => Ok(other),
    }
}

fn parse_get(reply: RespValue) -> ClientResult<Option<Vec<u8>>> {
    match reply {
        RespValue::Bulk(data) => Ok(data),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn parse_ok(reply: RespValue) -> ClientResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn parse_count(reply: RespValue) -> ClientResult<bool> {
    match reply {
        RespValue::Integer(count) => Ok(count > 0),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn parse_ttl(reply: RespValue) -> ClientResult<ClientTtl> {
    match reply {
        RespValue::Integer(-2) => Ok(ClientTtl::Missing),
        RespValue::Integer(-1) => Ok(ClientTtl::NoExpiry),
        RespValue::Integer(value) if value >= 0 => {
            Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64)))
        }
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn parse_text(reply: RespValue) -> ClientResult<Vec<u8>> {
    match reply {
        RespValue::Simple(text) => Ok(text),
        RespValue::Bulk(Some(data)) => Ok(data),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn parse_bulk(reply: RespValue) -> ClientResult<Vec<u8>> {
    match reply {
        RespValue::Bulk(Some(data)) => Ok(data),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
