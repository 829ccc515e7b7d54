//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or decoding hrpc wire data.
///
/// Every variant except [`ProtocolError::Io`] is fatal for the connection
/// that produced it: the peer is out of sync and no response can be routed
/// back to it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid connection preamble: expected magic \"hrpc\", got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version {got} (supported {min}..={max})")]
    UnsupportedVersion { got: u8, min: u8, max: u8 },

    #[error("invalid frame length {0}")]
    InvalidLength(i32),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("truncated payload: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown compression algorithm id {0}")]
    UnknownAlgorithm(u8),

    #[error("unknown compression algorithm name {0:?}")]
    UnknownAlgorithmName(String),

    #[error("compression algorithm {0} is not available in this build")]
    UnavailableAlgorithm(&'static str),

    #[error("string field of {size} bytes exceeds the 64 KiB wire limit")]
    StringTooLong { size: usize },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("trailing garbage after payload: {0} bytes")]
    TrailingBytes(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
