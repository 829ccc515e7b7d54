//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HRPC_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Call handling configuration.
    pub rpc: RpcConfig,
    /// Resource limits and sweep policy.
    pub limits: LimitsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("HRPC_CONFIG") {
            config = Self::from_file(&path)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.rpc.apply_env_overrides();
        self.limits.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.handler_count == 0 {
            return Err(ConfigError::ValidationError(
                "rpc.handler_count must be at least 1".to_string(),
            ));
        }
        if self.rpc.handler_queue_limit == 0 {
            return Err(ConfigError::ValidationError(
                "rpc.handler_queue_limit must be at least 1".to_string(),
            ));
        }
        if self.rpc.write_chunk_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "rpc.write_chunk_bytes must be at least 1".to_string(),
            ));
        }
        if self.limits.response_queues_max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "limits.response_queues_max_bytes must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to. Port 0 selects an ephemeral port.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Listen backlog.
    pub listen_backlog: u32,
    /// Disable Nagle's algorithm on accepted sockets.
    pub tcp_nodelay: bool,
    /// Enable keepalives on accepted sockets.
    pub tcp_keepalive: bool,
    /// Socket send buffer size in bytes (0 = OS default).
    pub send_buffer_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", hrpc_protocol::DEFAULT_PORT)
                .parse()
                .unwrap(),
            listen_backlog: 128,
            tcp_nodelay: true,
            tcp_keepalive: true,
            send_buffer_bytes: 0,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("HRPC_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
        if let Ok(backlog) = std::env::var("HRPC_LISTEN_BACKLOG") {
            if let Ok(n) = backlog.parse() {
                self.listen_backlog = n;
            }
        }
        if let Ok(nodelay) = std::env::var("HRPC_TCP_NODELAY") {
            self.tcp_nodelay = nodelay == "1" || nodelay.to_lowercase() == "true";
        }
        if let Ok(keepalive) = std::env::var("HRPC_TCP_KEEPALIVE") {
            self.tcp_keepalive = keepalive == "1" || keepalive.to_lowercase() == "true";
        }
        if let Ok(size) = std::env::var("HRPC_SEND_BUFFER_BYTES") {
            if let Ok(n) = size.parse() {
                self.send_buffer_bytes = n;
            }
        }
    }
}

/// Call handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Number of handler workers.
    pub handler_count: usize,
    /// Call queue capacity per handler.
    pub handler_queue_limit: usize,
    /// Maximum concurrently parsed payloads (0 = cpu_count + 1).
    pub deserialize_parallelism: usize,
    /// Socket writes larger than this are split into chunks of this size.
    pub write_chunk_bytes: usize,
    /// A queued response unwritten for this long closes its connection.
    pub purge_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            handler_count: 10,
            handler_queue_limit: 100,
            deserialize_parallelism: 0,
            write_chunk_bytes: 8 * 1024,
            purge_interval_ms: 15 * 60 * 1000,
        }
    }
}

impl RpcConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(count) = std::env::var("HRPC_HANDLER_COUNT") {
            if let Ok(n) = count.parse() {
                self.handler_count = n;
            }
        }
        if let Ok(limit) = std::env::var("HRPC_HANDLER_QUEUE_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.handler_queue_limit = n;
            }
        }
        if let Ok(parallelism) = std::env::var("HRPC_DESERIALIZE_PARALLELISM") {
            if let Ok(n) = parallelism.parse() {
                self.deserialize_parallelism = n;
            }
        }
    }

    /// Call queue capacity.
    pub fn call_queue_capacity(&self) -> usize {
        self.handler_count * self.handler_queue_limit
    }

    /// Effective parse parallelism.
    pub fn effective_deserialize_parallelism(&self) -> usize {
        if self.deserialize_parallelism > 0 {
            self.deserialize_parallelism
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                + 1
        }
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

/// Resource limits and idle-sweep policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Live-connection count above which the idle sweep starts running.
    pub idle_threshold: usize,
    /// Connections idle longer than this are eligible for eviction.
    pub max_idle_ms: u64,
    /// Maximum evictions per non-forced sweep.
    pub max_evictions_per_sweep: usize,
    /// Minimum interval between two sweep runs.
    pub sweep_interval_ms: u64,
    /// Ceiling on total bytes queued across all response queues.
    pub response_queues_max_bytes: u64,
    /// Largest accepted request frame.
    pub max_request_bytes: usize,
    /// Per-call cumulative response size ceiling.
    pub max_response_bytes: u64,
    /// Pause after a resource-exhaustion event before accepting again.
    pub exhaustion_pause_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            idle_threshold: 4000,
            max_idle_ms: 2000,
            max_evictions_per_sweep: 10,
            sweep_interval_ms: 10_000,
            response_queues_max_bytes: 1024 * 1024 * 1024,
            max_request_bytes: hrpc_protocol::DEFAULT_MAX_PAYLOAD_BYTES,
            max_response_bytes: 256 * 1024 * 1024,
            exhaustion_pause_ms: 60_000,
        }
    }
}

impl LimitsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(threshold) = std::env::var("HRPC_IDLE_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.idle_threshold = n;
            }
        }
        if let Ok(idle) = std::env::var("HRPC_MAX_IDLE_MS") {
            if let Ok(n) = idle.parse() {
                self.max_idle_ms = n;
            }
        }
        if let Ok(max) = std::env::var("HRPC_RESPONSE_QUEUES_MAX_BYTES") {
            if let Ok(n) = max.parse() {
                self.response_queues_max_bytes = n;
            }
        }
        if let Ok(max) = std::env::var("HRPC_MAX_REQUEST_BYTES") {
            if let Ok(n) = max.parse() {
                self.max_request_bytes = n;
            }
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn exhaustion_pause(&self) -> Duration {
        Duration::from_millis(self.exhaustion_pause_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the metrics HTTP endpoint.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "0.0.0.0:9090".parse().unwrap(),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("HRPC_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("HRPC_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
