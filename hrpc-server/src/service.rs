//! The application dispatcher trait and per-call context.
//!
//! The core treats request and response objects as opaque: anything
//! implementing the wire traits can be served. Handler-scoped data (remote
//! address, tag, profiling flag, identity) travels in an explicit
//! [`CallContext`] rather than thread-local state.

use bytes::Bytes;
use hrpc_protocol::{ProfilingData, WireDecode, WireEncode};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Error class reported when a call's cumulative response size crosses the
/// configured ceiling.
pub const RESPONSE_TOO_LARGE_CLASS: &str = "ResponseSizeLimitExceeded";

/// Application-defined dispatcher invoked once per call.
///
/// `call` runs on a handler worker; it should not block for long on its own
/// I/O. Errors become error response frames on the same call id, and the
/// connection stays open.
pub trait RpcService: Send + Sync + 'static {
    type Request: WireDecode + Send + 'static;
    type Response: WireEncode + Send + 'static;

    fn call(
        &self,
        request: Self::Request,
        ctx: &mut CallContext,
    ) -> Result<Self::Response, ServiceError>;
}

/// An application-level failure, reported to the client as an error frame
/// carrying the error class and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub class: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// The dedicated non-retryable error for per-call response quota
    /// violations.
    pub fn response_too_large(accumulated: u64, limit: u64) -> Self {
        Self::new(
            RESPONSE_TOO_LARGE_CLASS,
            format!("response size {accumulated} exceeds limit of {limit} bytes"),
        )
    }

    pub fn is_response_too_large(&self) -> bool {
        self.class == RESPONSE_TOO_LARGE_CLASS
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for ServiceError {}

/// Handler-scoped view of the call being served.
pub struct CallContext {
    remote_addr: SocketAddr,
    call_id: i32,
    version: u8,
    tag: Option<String>,
    identity: Bytes,
    received_at: Instant,
    profiling: Option<ProfilingData>,
    response_bytes: u64,
    max_response_bytes: u64,
}

impl CallContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        remote_addr: SocketAddr,
        call_id: i32,
        version: u8,
        tag: Option<String>,
        identity: Bytes,
        received_at: Instant,
        profile: bool,
        max_response_bytes: u64,
    ) -> Self {
        Self {
            remote_addr,
            call_id,
            version,
            tag,
            identity,
            received_at,
            profiling: profile.then(ProfilingData::new),
            response_bytes: 0,
            max_response_bytes,
        }
    }

    /// Remote address of the calling client.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Client-assigned call id, unique within the connection.
    pub fn call_id(&self) -> i32 {
        self.call_id
    }

    /// Protocol version negotiated by the connection.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Opaque tag from the call options, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The opaque identity blob received during the connection handshake.
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    /// When the call was parsed off the wire.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Whether the client asked this call to be profiled.
    pub fn profiling_requested(&self) -> bool {
        self.profiling.is_some()
    }

    /// Profiling sink, present only when the client requested profiling.
    pub fn profiling_mut(&mut self) -> Option<&mut ProfilingData> {
        self.profiling.as_mut()
    }

    pub(crate) fn take_profiling(&mut self) -> Option<ProfilingData> {
        self.profiling.take()
    }

    /// Bytes charged against this call's response quota so far.
    pub fn response_bytes(&self) -> u64 {
        self.response_bytes
    }

    /// Charges `n` bytes against the per-call response quota.
    ///
    /// Dispatchers that accumulate large results call this as they go; once
    /// the quota is exceeded the call must give up and surface the returned
    /// error, which reaches the client as an ordinary error frame.
    pub fn charge_response_bytes(&mut self, n: u64) -> Result<(), ServiceError> {
        let total = self.response_bytes.saturating_add(n);
        if total > self.max_response_bytes {
            return Err(ServiceError::response_too_large(
                total,
                self.max_response_bytes,
            ));
        }
        self.response_bytes = total;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(max_response_bytes: u64) -> CallContext {
        CallContext::new(
            "127.0.0.1:4242".parse().unwrap(),
            7,
            hrpc_protocol::CURRENT_VERSION,
            Some("scan".to_string()),
            Bytes::from_static(b"alice"),
            Instant::now(),
            true,
            max_response_bytes,
        )
    }

    #[test]
    fn test_context_accessors() {
        let mut ctx = test_ctx(1024);
        assert_eq!(ctx.call_id(), 7);
        assert_eq!(ctx.tag(), Some("scan"));
        assert_eq!(ctx.identity(), &Bytes::from_static(b"alice"));
        assert!(ctx.profiling_requested());
        ctx.profiling_mut().unwrap().record("rows", 3);
        assert_eq!(ctx.take_profiling().unwrap().get("rows"), Some(3));
    }

    #[test]
    fn test_response_quota() {
        let mut ctx = test_ctx(100);
        ctx.charge_response_bytes(60).unwrap();
        ctx.charge_response_bytes(40).unwrap();
        let err = ctx.charge_response_bytes(1).unwrap_err();
        assert!(err.is_response_too_large());
        // A failed charge does not advance the counter.
        assert_eq!(ctx.response_bytes(), 100);
    }
}
