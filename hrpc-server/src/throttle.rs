//! Global ceiling on queued response bytes.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Counts bytes currently queued across all response queues and blocks
/// producers once the ceiling is reached.
///
/// Every successful [`increase`](SizeThrottler::increase) must be matched by
/// exactly one [`decrease`](SizeThrottler::decrease): per response on a full
/// write, or one batched decrease covering a closed connection's drained
/// queue.
///
/// When the counter is zero, `increase` admits even an amount larger than
/// the ceiling — a single oversized response must not wedge the server.
pub struct SizeThrottler {
    limit: u64,
    current: Mutex<u64>,
    released: Notify,
}

impl SizeThrottler {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            current: Mutex::new(0),
            released: Notify::new(),
        }
    }

    /// Adds `n` to the counter, waiting until it fits under the ceiling.
    pub async fn increase(&self, n: u64) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut current = self.current.lock();
                if *current == 0 || *current + n <= self.limit {
                    *current += n;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Subtracts `n` and wakes blocked producers.
    pub fn decrease(&self, n: u64) {
        let mut current = self.current.lock();
        debug_assert!(*current >= n, "throttler underflow: {} - {}", *current, n);
        *current = current.saturating_sub(n);
        drop(current);
        self.released.notify_waiters();
    }

    /// Bytes currently accounted.
    pub fn current(&self) -> u64 {
        *self.current.lock()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}
