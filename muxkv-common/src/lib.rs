// muxkv-common - Shared types for the MuxKV multiplexing client
//
// This crate defines the error taxonomy, configuration, and the RESP2 codec
// shared by the client core and its transports.

pub mod config;
pub mod error;
pub mod resp;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use resp::*;
