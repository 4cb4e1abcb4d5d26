//! Outbound seam between a connection's writer and its socket.

use bytes::Bytes;

use muxkv_common::TransportError;

/// Accepts raw bytes destined for one physical socket.
///
/// Implementations must fail (typically with `TransportError::NotConnected`)
/// when the socket is gone rather than silently dropping bytes. Calls are
/// serialized by the connection's write lock, so implementations need not
/// guard against interleaving.
pub trait Transport: Send + Sync + 'static {
    fn write_to_socket(&self, raw: Bytes) -> Result<(), TransportError>;
}
