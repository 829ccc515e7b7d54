//! Length-prefixed framing and the per-connection framing state machine.
//!
//! Connection layout on the wire:
//!
//! ```text
//! +------+---------+--------+----------+--------+----------+-----
//! | hrpc | version | len u32| identity | len u32| call ... | ...
//! +------+---------+--------+----------+--------+----------+-----
//!   preamble (once)           first payload       every subsequent payload
//! ```
//!
//! A length prefix equal to [`PING_SENTINEL`](crate::PING_SENTINEL) is a
//! keepalive and carries no payload.

use crate::error::ProtocolError;
use crate::{CURRENT_VERSION, MAGIC, PING_SENTINEL, VERSION_3};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One complete unit pulled off the wire by [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Keepalive; never dispatched.
    Ping,
    /// First payload of the connection: the opaque authenticated-identity blob.
    Identity(Bytes),
    /// Any later payload: a call, still undecoded.
    Call(Bytes),
}

/// Incremental decoder for one connection's inbound byte stream.
///
/// Feed bytes into a `BytesMut` and repeatedly ask for the next event;
/// `Ok(None)` means the buffer ends mid-frame and all progress is kept for
/// the next read. Any error leaves the decoder unusable and must drop the
/// connection.
#[derive(Debug)]
pub struct FrameDecoder {
    version: Option<u8>,
    identity_seen: bool,
    pending_len: Option<usize>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            version: None,
            identity_seen: false,
            pending_len: None,
            max_payload,
        }
    }

    /// Protocol version announced in the preamble, once seen.
    pub fn version(&self) -> Option<u8> {
        self.version
    }

    /// Whether the identity payload has been consumed.
    pub fn identity_seen(&self) -> bool {
        self.identity_seen
    }

    /// Decodes the next event out of `buf`, consuming exactly the bytes used.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FrameEvent>, ProtocolError> {
        loop {
            if self.version.is_none() {
                if buf.len() < 5 {
                    return Ok(None);
                }
                let mut magic = [0u8; 4];
                magic.copy_from_slice(&buf[..4]);
                let version = buf[4];
                if magic != MAGIC {
                    return Err(ProtocolError::InvalidMagic(magic));
                }
                if !(VERSION_3..=CURRENT_VERSION).contains(&version) {
                    return Err(ProtocolError::UnsupportedVersion {
                        got: version,
                        min: VERSION_3,
                        max: CURRENT_VERSION,
                    });
                }
                buf.advance(5);
                self.version = Some(version);
                continue;
            }

            let len = match self.pending_len {
                Some(len) => len,
                None => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }
                    let raw = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    buf.advance(4);
                    if raw == PING_SENTINEL {
                        return Ok(Some(FrameEvent::Ping));
                    }
                    if raw < 0 {
                        return Err(ProtocolError::InvalidLength(raw));
                    }
                    let len = raw as usize;
                    if len > self.max_payload {
                        return Err(ProtocolError::FrameTooLarge {
                            size: len,
                            max: self.max_payload,
                        });
                    }
                    self.pending_len = Some(len);
                    len
                }
            };

            if buf.len() < len {
                return Ok(None);
            }
            let payload = buf.split_to(len).freeze();
            self.pending_len = None;
            if !self.identity_seen {
                self.identity_seen = true;
                return Ok(Some(FrameEvent::Identity(payload)));
            }
            return Ok(Some(FrameEvent::Call(payload)));
        }
    }
}

/// Writes the connection preamble a client must send first.
pub fn encode_preamble(buf: &mut BytesMut, version: u8) {
    buf.put_slice(&MAGIC);
    buf.put_u8(version);
}

/// Writes one length-prefixed frame around `payload`.
pub fn encode_frame(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);
}

/// Writes a keepalive frame.
pub fn encode_ping(buf: &mut BytesMut) {
    buf.put_i32(PING_SENTINEL);
}
