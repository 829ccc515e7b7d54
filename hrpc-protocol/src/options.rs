//! Per-call options record.
//!
//! Present in every call payload from protocol version 4 onward:
//!
//! ```text
//! +----------------+----------------+---------+-------------+-----------+
//! | tx_compression | rx_compression | profile | tag_present | [tag utf] |
//! |      u8        |      u8        |   u8    |     u8      |           |
//! +----------------+----------------+---------+-------------+-----------+
//! ```
//!
//! `tx` is the compression the client applied to the request body;
//! `rx` is the compression it wants on the response body.

use crate::compression::Algorithm;
use crate::error::ProtocolError;
use crate::wire;
use bytes::{BufMut, Bytes, BytesMut};

/// Options attached to a single call by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Compression of the request body as sent by the client.
    pub tx_compression: Algorithm,
    /// Compression requested for the response body.
    pub rx_compression: Algorithm,
    /// Whether the client asked for server-side profiling of this call.
    pub profile: bool,
    /// Opaque routing/diagnostic tag.
    pub tag: Option<String>,
}

impl CallOptions {
    pub fn with_rx_compression(mut self, algorithm: Algorithm) -> Self {
        self.rx_compression = algorithm;
        self
    }

    pub fn with_tx_compression(mut self, algorithm: Algorithm) -> Self {
        self.tx_compression = algorithm;
        self
    }

    pub fn with_profiling(mut self) -> Self {
        self.profile = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.tx_compression.id());
        buf.put_u8(self.rx_compression.id());
        wire::put_bool(buf, self.profile);
        match &self.tag {
            Some(tag) => {
                wire::put_bool(buf, true);
                wire::put_utf(buf, tag)?;
            }
            None => wire::put_bool(buf, false),
        }
        Ok(())
    }

    pub fn read_from(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let tx_compression = Algorithm::from_id(wire::get_u8(buf)?)?;
        let rx_compression = Algorithm::from_id(wire::get_u8(buf)?)?;
        let profile = wire::get_bool(buf)?;
        let tag = if wire::get_bool(buf)? {
            Some(wire::get_utf(buf)?)
        } else {
            None
        };
        Ok(Self {
            tx_compression,
            rx_compression,
            profile,
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_roundtrip() {
        let options = CallOptions::default();
        let mut buf = BytesMut::new();
        options.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        let decoded = CallOptions::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_full_options_roundtrip() {
        let options = CallOptions::default()
            .with_tx_compression(Algorithm::Gz)
            .with_rx_compression(Algorithm::Gz)
            .with_profiling()
            .with_tag("batch-loader");
        let mut buf = BytesMut::new();
        options.write_to(&mut buf).unwrap();
        let decoded = CallOptions::read_from(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0);
        assert!(matches!(
            CallOptions::read_from(&mut buf.freeze()),
            Err(ProtocolError::UnknownAlgorithm(9))
        ));
    }

    #[test]
    fn test_truncated_options() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(0);
        assert!(matches!(
            CallOptions::read_from(&mut buf.freeze()),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
