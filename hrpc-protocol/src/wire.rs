//! Primitive wire encodings and the opaque-object traits.
//!
//! All multi-byte integers are big-endian. Strings are encoded as a `u16`
//! length prefix followed by UTF-8 bytes.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fails with [`ProtocolError::Truncated`] unless `buf` holds `needed` bytes.
pub fn ensure(buf: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

/// Writes a length-prefixed UTF-8 string.
pub fn put_utf(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    if s.len() > u16::MAX as usize {
        return Err(ProtocolError::StringTooLong { size: s.len() });
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Reads a length-prefixed UTF-8 string.
pub fn get_utf(buf: &mut Bytes) -> Result<String, ProtocolError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool, ProtocolError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8() != 0)
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64, ProtocolError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Serialization half of an application-defined request or response object.
///
/// The server core never inspects object contents; it only moves encoded
/// bytes between the framing layer and the dispatcher.
pub trait WireEncode {
    fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError>;
}

/// Deserialization half of an application-defined request or response object.
///
/// Implementations must be self-delimiting: `read_from` consumes exactly the
/// bytes belonging to the object and leaves the rest of `buf` untouched.
pub trait WireDecode: Sized {
    fn read_from(buf: &mut Bytes) -> Result<Self, ProtocolError>;
}

/// Opaque blob, encoded as a `u32` length prefix plus raw bytes.
impl WireEncode for Bytes {
    fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
        Ok(())
    }
}

impl WireDecode for Bytes {
    fn read_from(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure(buf, 4)?;
        let len = buf.get_u32() as usize;
        ensure(buf, len)?;
        Ok(buf.split_to(len))
    }
}

impl WireEncode for String {
    fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        put_utf(buf, self)
    }
}

impl WireDecode for String {
    fn read_from(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        get_utf(buf)
    }
}
