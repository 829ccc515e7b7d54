//! # hrpc-server
//!
//! TCP RPC server core for hrpc.
//!
//! This crate provides:
//! - Accept loop with per-socket option handling and lifecycle control
//! - Per-connection readers driving the framing state machine
//! - A bounded call queue feeding a fixed handler pool
//! - Per-connection response queues with a single writer each
//! - A global throttler capping total queued response bytes
//! - Idle-connection sweeping and stalled-response purging
//! - Configuration loading and Prometheus metrics

pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod service;
pub mod throttle;

mod connection;
mod handler;
mod reader;
mod writer;

pub use config::{Config, LimitsConfig, MetricsConfig, NetworkConfig, RpcConfig};
pub use error::{BindErrorKind, ServerError};
pub use metrics::Metrics;
pub use server::{ExhaustionAction, ExhaustionPolicy, Server};
pub use service::{CallContext, RpcService, ServiceError};
pub use throttle::SizeThrottler;
