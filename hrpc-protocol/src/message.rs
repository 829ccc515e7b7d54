//! Call payload and response frame encodings.
//!
//! Request payload (everything after the length prefix):
//!
//! ```text
//! +---------+----------------------+----------------------------------+
//! | call id | options (version>=4) | request object [tx-compressed]   |
//! |  i32    |                      |                                  |
//! +---------+----------------------+----------------------------------+
//! ```
//!
//! Response frame:
//!
//! ```text
//! +---------+-------+--------------------------+-------------------------+
//! | call id | error | algo name (version>=4)   | body [rx-compressed]    |
//! |  i32    |  u8   | utf                      |                         |
//! +---------+-------+--------------------------+-------------------------+
//! body on success: response object, then (version>=4) profiled flag and
//!                  profiling record when profiled
//! body on error:   error class utf, error message utf
//! ```

use crate::compression::Algorithm;
use crate::error::ProtocolError;
use crate::options::CallOptions;
use crate::profiling::ProfilingData;
use crate::wire::{self, WireDecode, WireEncode};
use crate::VERSION_RPC_OPTIONS;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Read;

/// A call payload after framing: id, options, and the (decompressed) body
/// holding the encoded request object.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub call_id: i32,
    pub options: CallOptions,
    pub body: Bytes,
}

impl RequestFrame {
    /// Parses one call payload. `version` is the connection's negotiated
    /// protocol version; below 4 no options record is present and the body
    /// is never compressed.
    pub fn parse(payload: Bytes, version: u8) -> Result<Self, ProtocolError> {
        let mut buf = payload;
        let call_id = wire::get_i32(&mut buf)?;
        let options = if version >= VERSION_RPC_OPTIONS {
            CallOptions::read_from(&mut buf)?
        } else {
            CallOptions::default()
        };
        let body = match options.tx_compression {
            Algorithm::None => buf,
            algorithm => Bytes::from(algorithm.decompress(&buf)?),
        };
        Ok(Self {
            call_id,
            options,
            body,
        })
    }

    /// Encodes a call payload the way a client sends it (without the outer
    /// length prefix).
    pub fn encode<R: WireEncode>(
        call_id: i32,
        version: u8,
        options: &CallOptions,
        request: &R,
    ) -> Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        payload.put_i32(call_id);
        if version >= VERSION_RPC_OPTIONS {
            options.write_to(&mut payload)?;
        }
        let mut body = BytesMut::new();
        request.write_to(&mut body)?;
        match options.tx_compression {
            Algorithm::None => payload.unsplit(body),
            algorithm => payload.put_slice(&algorithm.compress(&body)?),
        }
        Ok(payload)
    }
}

/// Encodes a success response frame.
pub fn encode_success<R: WireEncode>(
    call_id: i32,
    version: u8,
    algorithm: Algorithm,
    response: &R,
    profiling: Option<&ProfilingData>,
) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    response.write_to(&mut body)?;
    if version >= VERSION_RPC_OPTIONS {
        match profiling {
            Some(data) => {
                wire::put_bool(&mut body, true);
                data.write_to(&mut body)?;
            }
            None => wire::put_bool(&mut body, false),
        }
    }
    finish_response(call_id, version, algorithm, false, body)
}

/// Encodes an error response frame carrying the error class and message.
pub fn encode_error(
    call_id: i32,
    version: u8,
    algorithm: Algorithm,
    error_class: &str,
    error_message: &str,
) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    wire::put_utf(&mut body, error_class)?;
    wire::put_utf(&mut body, error_message)?;
    finish_response(call_id, version, algorithm, true, body)
}

fn finish_response(
    call_id: i32,
    version: u8,
    algorithm: Algorithm,
    error: bool,
    body: BytesMut,
) -> Result<Bytes, ProtocolError> {
    let mut frame = BytesMut::with_capacity(body.len() + 16);
    frame.put_i32(call_id);
    wire::put_bool(&mut frame, error);
    if version >= VERSION_RPC_OPTIONS {
        wire::put_utf(&mut frame, algorithm.wire_name())?;
        match algorithm {
            Algorithm::None => frame.unsplit(body),
            algorithm => frame.put_slice(&algorithm.compress(&body)?),
        }
    } else {
        frame.unsplit(body);
    }
    Ok(frame.freeze())
}

/// Decoded body of a response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody<R> {
    Success {
        response: R,
        profiling: Option<ProfilingData>,
    },
    Error {
        class: String,
        message: String,
    },
}

/// A fully decoded response frame, as seen by a client.
#[derive(Debug, Clone)]
pub struct ResponseFrame<R> {
    pub call_id: i32,
    pub algorithm: Algorithm,
    pub body: ResponseBody<R>,
}

impl<R: WireDecode> ResponseFrame<R> {
    /// Attempts to parse one response frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer ends mid-frame; the buffer is only
    /// consumed once a whole frame parses.
    pub fn try_parse(
        buf: &mut BytesMut,
        version: u8,
    ) -> Result<Option<Self>, ProtocolError> {
        let mut attempt = Bytes::copy_from_slice(buf);
        let before = attempt.len();
        match Self::parse(&mut attempt, version) {
            Ok(frame) => {
                buf.advance(before - attempt.len());
                Ok(Some(frame))
            }
            Err(ProtocolError::Truncated { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Parses one response frame, consuming exactly its bytes from `buf`.
    pub fn parse(buf: &mut Bytes, version: u8) -> Result<Self, ProtocolError> {
        let call_id = wire::get_i32(buf)?;
        let error = wire::get_bool(buf)?;
        let algorithm = if version >= VERSION_RPC_OPTIONS {
            Algorithm::from_wire_name(&wire::get_utf(buf)?)?
        } else {
            Algorithm::None
        };

        let body = match algorithm {
            Algorithm::None => Self::read_body(buf, version, error)?,
            algorithm => {
                let (decompressed, consumed) = decompress_prefix(algorithm, buf)?;
                let mut body_buf = Bytes::from(decompressed);
                let body = Self::read_body(&mut body_buf, version, error)?;
                if !body_buf.is_empty() {
                    return Err(ProtocolError::TrailingBytes(body_buf.len()));
                }
                buf.advance(consumed);
                body
            }
        };

        Ok(Self {
            call_id,
            algorithm,
            body,
        })
    }

    fn read_body(
        buf: &mut Bytes,
        version: u8,
        error: bool,
    ) -> Result<ResponseBody<R>, ProtocolError> {
        if error {
            let class = wire::get_utf(buf)?;
            let message = wire::get_utf(buf)?;
            return Ok(ResponseBody::Error { class, message });
        }
        let response = R::read_from(buf)?;
        let profiling = if version >= VERSION_RPC_OPTIONS && wire::get_bool(buf)? {
            Some(ProfilingData::read_from(buf)?)
        } else {
            None
        };
        Ok(ResponseBody::Success {
            response,
            profiling,
        })
    }
}

/// Decompresses one complete compressed stream from the front of `buf`,
/// reporting how many compressed bytes it spanned. An incomplete stream is
/// reported as [`ProtocolError::Truncated`] so callers can wait for more
/// bytes.
fn decompress_prefix(
    algorithm: Algorithm,
    buf: &Bytes,
) -> Result<(Vec<u8>, usize), ProtocolError> {
    match algorithm {
        Algorithm::None => Ok((buf.to_vec(), buf.len())),
        Algorithm::Gz => {
            let cursor = std::io::Cursor::new(&buf[..]);
            let mut decoder = flate2::bufread::GzDecoder::new(cursor);
            let mut out = Vec::new();
            match decoder.read_to_end(&mut out) {
                Ok(_) => {
                    let consumed = decoder.into_inner().position() as usize;
                    Ok((out, consumed))
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Err(ProtocolError::Truncated { needed: 1 })
                }
                Err(err) => Err(ProtocolError::Io(err)),
            }
        }
        Algorithm::Lzo => Err(ProtocolError::UnavailableAlgorithm("LZO")),
    }
}
