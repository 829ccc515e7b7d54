//! Per-connection read loop.
//!
//! One task owns each connection's read half, so frames on a connection are
//! parsed strictly in arrival order and at most one parse of a given socket
//! runs at a time. Parse parallelism across connections is bounded by the
//! deserialization permits; a saturated pool blocks this loop, which in turn
//! backpressures the peer through TCP.

use crate::connection::Connection;
use crate::error::ServerError;
use crate::handler::ServerCall;
use crate::server::ServerShared;
use crate::service::RpcService;
use bytes::{Bytes, BytesMut};
use hrpc_protocol::{FrameDecoder, FrameEvent, RequestFrame, WireDecode, CURRENT_VERSION};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Reads and dispatches frames until the peer disconnects, the connection is
/// closed elsewhere, or a protocol/decode error makes the stream unusable.
///
/// The caller closes the connection when this returns, whatever the outcome.
pub(crate) async fn read_loop<S: RpcService>(
    shared: &Arc<ServerShared<S>>,
    conn: &Arc<Connection>,
    read_half: &mut OwnedReadHalf,
) -> Result<(), ServerError> {
    let mut decoder = FrameDecoder::new(shared.config.limits.max_request_bytes);
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        while let Some(event) = decoder.decode(&mut buf)? {
            conn.touch();
            match event {
                FrameEvent::Ping => {
                    tracing::trace!("[{}] ping", conn);
                }
                FrameEvent::Identity(blob) => {
                    tracing::trace!("[{}] identity received ({} bytes)", conn, blob.len());
                    conn.set_identity(blob);
                }
                FrameEvent::Call(payload) => {
                    let version = decoder.version().unwrap_or(CURRENT_VERSION);
                    let call = {
                        let _permit = shared
                            .decode_permits
                            .acquire()
                            .await
                            .map_err(|_| ServerError::ShuttingDown)?;
                        parse_call::<S>(conn, payload, version)?
                    };
                    tracing::trace!("[{}] got #{}", conn, call.call_id);
                    let closed = conn.closed_notify.notified();
                    tokio::pin!(closed);
                    closed.as_mut().enable();
                    if conn.is_closed() {
                        return Ok(());
                    }
                    conn.inc_outstanding();
                    shared.queued_calls.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.call_queue_depth.inc();

                    // Blocks when the call queue is full; this is the
                    // designed backpressure into the TCP receive window.
                    tokio::select! {
                        result = shared.call_tx.send(call) => {
                            if result.is_err() {
                                return Err(ServerError::ShuttingDown);
                            }
                        }
                        _ = &mut closed => {
                            shared.queued_calls.fetch_sub(1, Ordering::Relaxed);
                            shared.metrics.call_queue_depth.dec();
                            return Ok(());
                        }
                    }
                }
            }
        }

        let closed = conn.closed_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if conn.is_closed() {
            return Ok(());
        }

        tokio::select! {
            result = read_half.read_buf(&mut buf) => match result {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(ServerError::Io(err)),
            },
            _ = &mut closed => return Ok(()),
        }
    }
}

fn parse_call<S: RpcService>(
    conn: &Arc<Connection>,
    payload: Bytes,
    version: u8,
) -> Result<ServerCall<S::Request>, ServerError> {
    let frame = RequestFrame::parse(payload, version)?;
    let mut body = frame.body;
    let request = S::Request::read_from(&mut body)?;
    Ok(ServerCall {
        conn: conn.clone(),
        call_id: frame.call_id,
        request,
        version,
        rx_compression: frame.options.rx_compression,
        profile: frame.options.profile,
        tag: frame.options.tag,
        received_at: Instant::now(),
    })
}
