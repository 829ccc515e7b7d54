//! Per-connection write loop.
//!
//! Drains the connection's response queue in FIFO order, so responses go out
//! in handler-completion order. Large frames are written in fixed-size
//! chunks. A head response that cannot be flushed before its purge deadline
//! closes the connection, bounding per-connection response latency.

use crate::connection::Connection;
use crate::server::ServerShared;
use crate::service::RpcService;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;

enum WriteOutcome {
    Done,
    Stalled,
    Aborted,
    Failed(std::io::Error),
}

pub(crate) async fn write_loop<S: RpcService>(
    shared: Arc<ServerShared<S>>,
    conn: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
) {
    let chunk_bytes = shared.config.rpc.write_chunk_bytes;
    let purge_interval = shared.config.rpc.purge_interval();

    loop {
        let response = loop {
            if let Some(response) = conn.pop_response() {
                break response;
            }
            let ready = conn.response_ready.notified();
            let closed = conn.closed_notify.notified();
            tokio::pin!(ready, closed);
            ready.as_mut().enable();
            closed.as_mut().enable();
            if let Some(response) = conn.pop_response() {
                break response;
            }
            if conn.is_closed() {
                let _ = write_half.shutdown().await;
                return;
            }
            tokio::select! {
                _ = &mut ready => {}
                _ = &mut closed => {}
            }
        };

        let deadline = response.enqueued_at + purge_interval;
        match write_frame(&conn, &mut write_half, &response.frame, chunk_bytes, deadline).await {
            WriteOutcome::Done => {
                shared.throttler.decrease(response.charged);
                shared
                    .metrics
                    .response_queue_bytes
                    .set(shared.throttler.current() as f64);
                conn.dec_outstanding();
                conn.touch();
                tracing::trace!(
                    "[{}] responded to #{} ({} bytes)",
                    conn,
                    response.call_id,
                    response.frame.len()
                );
            }
            WriteOutcome::Stalled => {
                tracing::warn!(
                    "[{}] response #{} unwritten past purge interval, closing",
                    conn,
                    response.call_id
                );
                shared.metrics.connections_purged_total.inc();
                shared.throttler.decrease(response.charged);
                shared
                    .metrics
                    .response_queue_bytes
                    .set(shared.throttler.current() as f64);
                shared.close_connection(&conn, "response stalled past purge interval");
                return;
            }
            WriteOutcome::Aborted => {
                // Connection closed elsewhere mid-write; its queue was
                // already drained, only the in-hand response needs refunding.
                shared.throttler.decrease(response.charged);
                shared
                    .metrics
                    .response_queue_bytes
                    .set(shared.throttler.current() as f64);
                let _ = write_half.shutdown().await;
                return;
            }
            WriteOutcome::Failed(err) => {
                tracing::debug!(
                    "[{}] write error on #{}: {}",
                    conn,
                    response.call_id,
                    err
                );
                shared.throttler.decrease(response.charged);
                shared
                    .metrics
                    .response_queue_bytes
                    .set(shared.throttler.current() as f64);
                shared.close_connection(&conn, "write error");
                return;
            }
        }
    }
}

async fn write_frame(
    conn: &Connection,
    write_half: &mut OwnedWriteHalf,
    frame: &Bytes,
    chunk_bytes: usize,
    deadline: Instant,
) -> WriteOutcome {
    let deadline = tokio::time::Instant::from_std(deadline);
    let mut offset = 0;
    while offset < frame.len() {
        let closed = conn.closed_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if conn.is_closed() {
            return WriteOutcome::Aborted;
        }
        let end = (offset + chunk_bytes).min(frame.len());
        tokio::select! {
            result = tokio::time::timeout_at(deadline, write_half.write_all(&frame[offset..end])) => {
                match result {
                    Err(_) => return WriteOutcome::Stalled,
                    Ok(Err(err)) => return WriteOutcome::Failed(err),
                    Ok(Ok(())) => offset = end,
                }
            }
            _ = &mut closed => return WriteOutcome::Aborted,
        }
    }
    WriteOutcome::Done
}
