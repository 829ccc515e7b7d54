//! Handler workers.
//!
//! A fixed pool of tasks pops calls off the shared bounded queue, runs the
//! application dispatcher, serializes the reply, and hands it to the
//! connection's writer under the global byte throttle. Handlers never talk
//! to each other; they synchronize with the writer only through the
//! per-connection response queue.

use crate::connection::{Connection, QueuedResponse};
use crate::server::ServerShared;
use crate::service::{CallContext, RpcService, ServiceError};
use hrpc_protocol::profiling::TOTAL_SERVER_TIME_MS;
use hrpc_protocol::{message, Algorithm};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// One parsed call in flight between the reader and its response.
pub(crate) struct ServerCall<R> {
    pub conn: Arc<Connection>,
    pub call_id: i32,
    pub request: R,
    pub version: u8,
    pub rx_compression: Algorithm,
    pub profile: bool,
    pub tag: Option<String>,
    pub received_at: Instant,
}

/// Body of one handler worker. Exits on server shutdown.
pub(crate) async fn handler_loop<S: RpcService>(shared: Arc<ServerShared<S>>, worker: usize) {
    tracing::debug!("handler {} starting", worker);
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let call = {
            let mut rx = tokio::select! {
                guard = shared.call_rx.lock() => guard,
                _ = shutdown.recv() => break,
            };
            tokio::select! {
                call = rx.recv() => call,
                _ = shutdown.recv() => break,
            }
        };
        let Some(call) = call else { break };
        shared.queued_calls.fetch_sub(1, Ordering::Relaxed);
        shared.metrics.call_queue_depth.dec();
        handle_one(&shared, call).await;
    }
    tracing::debug!("handler {} exiting", worker);
}

async fn handle_one<S: RpcService>(shared: &Arc<ServerShared<S>>, call: ServerCall<S::Request>) {
    let ServerCall {
        conn,
        call_id,
        request,
        version,
        rx_compression,
        profile,
        tag,
        received_at,
    } = call;

    let mut ctx = CallContext::new(
        conn.remote_addr(),
        call_id,
        version,
        tag,
        conn.identity(),
        received_at,
        profile,
        shared.config.limits.max_response_bytes,
    );

    let service = shared.service.clone();
    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| service.call(request, &mut ctx)));
    let elapsed = start.elapsed();
    shared.metrics.call_duration.observe(elapsed.as_secs_f64());

    let result = result.unwrap_or_else(|payload| {
        tracing::warn!("[{}] handler panicked serving #{}", conn, call_id);
        Err(ServiceError::new("HandlerPanicked", panic_message(&payload)))
    });

    if let Some(profiling) = ctx.profiling_mut() {
        profiling.record(TOTAL_SERVER_TIME_MS, elapsed.as_millis() as i64);
    }

    let frame = match &result {
        Ok(response) => {
            shared.metrics.calls_total.with_label_values(&["ok"]).inc();
            let profiling = ctx.take_profiling();
            message::encode_success(call_id, version, rx_compression, response, profiling.as_ref())
        }
        Err(err) => {
            tracing::debug!("[{}] call #{} failed: {}", conn, call_id, err);
            shared
                .metrics
                .calls_total
                .with_label_values(&["error"])
                .inc();
            message::encode_error(call_id, version, rx_compression, &err.class, &err.message)
        }
    };

    let frame = match frame {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!("[{}] failed to serialize response for #{}: {}", conn, call_id, err);
            shared.close_connection(&conn, "response serialization failed");
            return;
        }
    };

    // Primary backpressure point: blocks while total queued response bytes
    // would cross the global ceiling.
    let charged = frame.len() as u64;
    shared.throttler.increase(charged).await;
    shared
        .metrics
        .response_queue_bytes
        .set(shared.throttler.current() as f64);

    let queued = QueuedResponse {
        call_id,
        frame,
        charged,
        enqueued_at: Instant::now(),
    };
    if let Err(bounced) = conn.enqueue_response(queued) {
        // Connection closed while we were serving; the response is discarded
        // and its bytes returned.
        shared.throttler.decrease(bounced.charged);
        shared
            .metrics
            .response_queue_bytes
            .set(shared.throttler.current() as f64);
        tracing::trace!("[{}] discarding response #{} for closed connection", conn, call_id);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
