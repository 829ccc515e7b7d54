//! # hrpc-protocol
//!
//! Wire protocol implementation for hrpc.
//!
//! This crate provides:
//! - The connection preamble (magic + version byte) and length-prefixed framing
//! - The incremental per-connection framing state machine
//! - The call options record (compression, profiling, tagging)
//! - Response frame encoding and the matching client-side parser
//! - `WireEncode`/`WireDecode`, the traits that keep request and response
//!   objects opaque to the server core

pub mod compression;
pub mod error;
pub mod frame;
pub mod message;
pub mod options;
pub mod profiling;
pub mod wire;

pub use compression::Algorithm;
pub use error::ProtocolError;
pub use frame::{FrameDecoder, FrameEvent};
pub use message::{RequestFrame, ResponseBody, ResponseFrame};
pub use options::CallOptions;
pub use profiling::ProfilingData;
pub use wire::{WireDecode, WireEncode};

/// The first four bytes of every hrpc connection.
pub const MAGIC: [u8; 4] = *b"hrpc";

/// Oldest protocol version still accepted.
pub const VERSION_3: u8 = 3;

/// Version that introduced the per-call options record with compression,
/// profiling, and tagging.
pub const VERSION_RPC_OPTIONS: u8 = 4;

/// Version spoken by this implementation.
pub const CURRENT_VERSION: u8 = VERSION_RPC_OPTIONS;

/// Reserved length-prefix value denoting a keepalive with no payload.
pub const PING_SENTINEL: i32 = -1;

/// Default port for hrpc servers.
pub const DEFAULT_PORT: u16 = 7420;

/// Default cap on a single frame payload (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;
