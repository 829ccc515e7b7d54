//! Connection records and the live-connection registry.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A serialized response waiting to be flushed to its socket.
#[derive(Debug)]
pub(crate) struct QueuedResponse {
    pub call_id: i32,
    pub frame: Bytes,
    /// Byte count charged against the throttler for this response.
    pub charged: u64,
    /// When the handler appended this response to the queue.
    pub enqueued_at: Instant,
}

#[derive(Default)]
struct ResponseQueue {
    queue: VecDeque<QueuedResponse>,
    closed: bool,
}

/// One accepted TCP connection.
///
/// Created by the acceptor; the read task mutates framing state and
/// last-contact, handlers append responses, the write task pops them. The
/// record outlives its socket so eviction and accounting can finish after
/// the peer is gone.
pub(crate) struct Connection {
    remote_addr: SocketAddr,
    last_contact_ms: AtomicU64,
    /// Calls parsed but not yet fully written.
    outstanding: AtomicUsize,
    identity: OnceLock<Bytes>,
    responses: Mutex<ResponseQueue>,
    /// Wakes the write task when a response lands in the queue.
    pub(crate) response_ready: Notify,
    /// Wakes both per-connection tasks when the connection closes.
    pub(crate) closed_notify: Notify,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            remote_addr,
            last_contact_ms: AtomicU64::new(now_ms()),
            outstanding: AtomicUsize::new(0),
            identity: OnceLock::new(),
            responses: Mutex::new(ResponseQueue::default()),
            response_ready: Notify::new(),
            closed_notify: Notify::new(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Refreshes the last-contact timestamp.
    pub fn touch(&self) {
        self.last_contact_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_contact_ms(&self) -> u64 {
        self.last_contact_ms.load(Ordering::Relaxed)
    }

    pub fn inc_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_outstanding(&self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Idle means no call is parsed-but-unanswered.
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Eviction test used by the idle sweep.
    pub fn timed_out(&self, now_ms: u64, max_idle_ms: u64) -> bool {
        self.is_idle() && now_ms.saturating_sub(self.last_contact_ms()) > max_idle_ms
    }

    /// Stores the identity blob from the handshake payload. Only the first
    /// write sticks.
    pub fn set_identity(&self, identity: Bytes) {
        let _ = self.identity.set(identity);
    }

    pub fn identity(&self) -> Bytes {
        self.identity.get().cloned().unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.responses.lock().closed
    }

    /// Appends a response for the writer, unless the connection has closed.
    ///
    /// On `Err` the response never entered the queue and the caller must
    /// refund its throttler charge.
    pub fn enqueue_response(&self, response: QueuedResponse) -> Result<(), QueuedResponse> {
        {
            let mut responses = self.responses.lock();
            if responses.closed {
                return Err(response);
            }
            responses.queue.push_back(response);
        }
        self.response_ready.notify_one();
        Ok(())
    }

    /// Pops the next response to write. Only the write task calls this.
    pub fn pop_response(&self) -> Option<QueuedResponse> {
        self.responses.lock().queue.pop_front()
    }

    pub fn queued_responses(&self) -> usize {
        self.responses.lock().queue.len()
    }

    /// Marks the connection closed and drains its queue, returning the total
    /// bytes to refund. Idempotent: later calls return `None`.
    pub fn begin_close(&self) -> Option<u64> {
        let drained = {
            let mut responses = self.responses.lock();
            if responses.closed {
                return None;
            }
            responses.closed = true;
            responses.queue.drain(..).map(|r| r.charged).sum()
        };
        self.closed_notify.notify_waiters();
        self.response_ready.notify_waiters();
        Some(drained)
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.remote_addr)
    }
}

/// Ordered collection of live connections, scanned by the idle sweep.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    inner: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.inner.lock().push(conn);
    }

    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.iter().position(|c| Arc::ptr_eq(c, conn)) {
            inner.swap_remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Removes and returns every connection; used at shutdown.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Selects idle-expired connections for eviction.
    ///
    /// A non-forced sweep scans a random contiguous range and stops at
    /// `max_evictions`; a forced sweep scans everything with no cap. The
    /// lock is held only to clone candidates out.
    pub fn collect_expired(
        &self,
        now_ms: u64,
        max_idle_ms: u64,
        max_evictions: usize,
        force: bool,
    ) -> Vec<Arc<Connection>> {
        let snapshot: Vec<Arc<Connection>> = {
            let inner = self.inner.lock();
            if inner.is_empty() {
                return Vec::new();
            }
            if force {
                inner.clone()
            } else {
                let mut rng = rand::thread_rng();
                let a = rng.gen_range(0..inner.len());
                let b = rng.gen_range(0..inner.len());
                let (start, end) = if a <= b { (a, b) } else { (b, a) };
                inner[start..=end].to_vec()
            }
        };

        let mut expired = Vec::new();
        for conn in snapshot {
            if conn.timed_out(now_ms, max_idle_ms) {
                expired.push(conn);
                if !force && expired.len() >= max_evictions {
                    break;
                }
            }
        }
        expired
    }
}
