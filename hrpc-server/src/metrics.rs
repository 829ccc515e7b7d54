//! Prometheus metrics for the hrpc server.
//!
//! The registry itself is always live; the HTTP scrape endpoint is opt-in
//! and serves `/metrics` plus a `/healthz` liveness probe.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Prometheus metrics for the hrpc server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Connections closed by the idle sweep.
    pub connections_evicted_total: Counter,
    /// Connections closed by the stalled-response purge.
    pub connections_purged_total: Counter,
    /// Total calls dispatched, labelled by outcome.
    pub calls_total: CounterVec,
    /// Calls waiting in the call queue.
    pub call_queue_depth: Gauge,
    /// Bytes queued across all response queues.
    pub response_queue_bytes: Gauge,
    /// Handler time per call.
    pub call_duration: Histogram,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "hrpc_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "hrpc_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_evicted_total = Counter::with_opts(Opts::new(
            "hrpc_connections_evicted_total",
            "Connections closed by the idle sweep",
        ))?;
        registry.register(Box::new(connections_evicted_total.clone()))?;

        let connections_purged_total = Counter::with_opts(Opts::new(
            "hrpc_connections_purged_total",
            "Connections closed because a response stalled past the purge interval",
        ))?;
        registry.register(Box::new(connections_purged_total.clone()))?;

        let calls_total = CounterVec::new(
            Opts::new("hrpc_calls_total", "Total calls dispatched by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let call_queue_depth = Gauge::with_opts(Opts::new(
            "hrpc_call_queue_depth",
            "Calls waiting for a handler",
        ))?;
        registry.register(Box::new(call_queue_depth.clone()))?;

        let response_queue_bytes = Gauge::with_opts(Opts::new(
            "hrpc_response_queue_bytes",
            "Bytes queued across all response queues",
        ))?;
        registry.register(Box::new(response_queue_bytes.clone()))?;

        let call_duration = Histogram::with_opts(
            HistogramOpts::new("hrpc_call_duration_seconds", "Handler time per call")
                .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(call_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_evicted_total,
            connections_purged_total,
            calls_total,
            call_queue_depth,
            response_queue_bytes,
            call_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

/// Serves the scrape endpoint until `shutdown` fires.
///
/// `/metrics` returns the Prometheus text payload, `/healthz` answers
/// liveness probes; everything else is a 404.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics endpoint on http://{}/metrics", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!("metrics endpoint accept failed: {}", err);
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move { Ok::<_, hyper::Error>(route(request.uri().path(), &metrics)) }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("metrics scrape from {} ended early: {}", peer, err);
            }
        });
    }

    tracing::debug!("metrics endpoint stopped");
    Ok(())
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    let (status, content_type, body) = match path {
        "/metrics" => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.encode(),
        ),
        "/healthz" => (StatusCode::OK, "text/plain", b"ok\n".to_vec()),
        _ => (StatusCode::NOT_FOUND, "text/plain", b"not found\n".to_vec()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
