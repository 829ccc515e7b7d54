//! Server error types.

use hrpc_protocol::ProtocolError;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Why a bind attempt failed, beyond the raw OS error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindErrorKind {
    AddressInUse,
    PermissionDenied,
    UnresolvableAddress,
    Other,
}

impl fmt::Display for BindErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindErrorKind::AddressInUse => write!(f, "address already in use"),
            BindErrorKind::PermissionDenied => write!(f, "permission denied"),
            BindErrorKind::UnresolvableAddress => write!(f, "address not available on this host"),
            BindErrorKind::Other => write!(f, "bind failed"),
        }
    }
}

impl BindErrorKind {
    pub fn classify(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => BindErrorKind::AddressInUse,
            std::io::ErrorKind::PermissionDenied => BindErrorKind::PermissionDenied,
            std::io::ErrorKind::AddrNotAvailable => BindErrorKind::UnresolvableAddress,
            _ => BindErrorKind::Other,
        }
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to bind {addr}: {kind}: {source}")]
    Bind {
        addr: SocketAddr,
        kind: BindErrorKind,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        ServerError::Bind {
            addr,
            kind: BindErrorKind::classify(&source),
            source,
        }
    }
}
