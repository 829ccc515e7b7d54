//! Per-call compression algorithms.
//!
//! The algorithm set is a fixed wire-compatible enum, not an extensible
//! registry: peers agree on numeric ids and names, so adding a variant is a
//! protocol change.

use crate::error::ProtocolError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use std::io::{Read, Write};

/// Compression applied to one direction of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    None,
    Gz,
    /// Recognized on the wire for compatibility; not available in this build.
    Lzo,
}

impl Algorithm {
    pub const fn id(self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Gz => 1,
            Algorithm::Lzo => 2,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, ProtocolError> {
        match id {
            0 => Ok(Algorithm::None),
            1 => Ok(Algorithm::Gz),
            2 => Ok(Algorithm::Lzo),
            other => Err(ProtocolError::UnknownAlgorithm(other)),
        }
    }

    /// Name carried in response frames.
    pub const fn wire_name(self) -> &'static str {
        match self {
            Algorithm::None => "NONE",
            Algorithm::Gz => "GZ",
            Algorithm::Lzo => "LZO",
        }
    }

    pub fn from_wire_name(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "NONE" => Ok(Algorithm::None),
            "GZ" => Ok(Algorithm::Gz),
            "LZO" => Ok(Algorithm::Lzo),
            other => Err(ProtocolError::UnknownAlgorithmName(other.to_string())),
        }
    }

    /// Compresses a fully-buffered body. `None` copies through.
    pub fn compress(self, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Algorithm::None => Ok(body.to_vec()),
            Algorithm::Gz => {
                let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
                encoder.write_all(body)?;
                Ok(encoder.finish()?)
            }
            Algorithm::Lzo => Err(ProtocolError::UnavailableAlgorithm("LZO")),
        }
    }

    /// Decompresses a fully-buffered body. `None` copies through.
    pub fn decompress(self, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Algorithm::None => Ok(body.to_vec()),
            Algorithm::Gz => {
                let mut decoder = GzDecoder::new(body);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            Algorithm::Lzo => Err(ProtocolError::UnavailableAlgorithm("LZO")),
        }
    }
}
