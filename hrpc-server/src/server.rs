//! The server: acceptor, lifecycle, idle sweep, and shared state.

use crate::config::Config;
use crate::connection::{now_ms, Connection, ConnectionRegistry};
use crate::error::ServerError;
use crate::handler::{handler_loop, ServerCall};
use crate::metrics::Metrics;
use crate::reader::read_loop;
use crate::service::RpcService;
use crate::throttle::SizeThrottler;
use crate::writer::write_loop;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};

/// What to do after a resource-exhaustion event on the accept path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionAction {
    /// Log, force an idle sweep, pause, keep serving.
    Continue,
    /// Terminate the server loop.
    Exit,
}

/// Installable policy consulted when accepting hits EMFILE/ENFILE/ENOMEM.
pub trait ExhaustionPolicy: Send + Sync + 'static {
    fn on_exhaustion(&self, error: &std::io::Error) -> ExhaustionAction;
}

impl<F> ExhaustionPolicy for F
where
    F: Fn(&std::io::Error) -> ExhaustionAction + Send + Sync + 'static,
{
    fn on_exhaustion(&self, error: &std::io::Error) -> ExhaustionAction {
        self(error)
    }
}

fn is_exhaustion(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::OutOfMemory {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOMEM
    )
}

/// State shared by the acceptor, readers, handlers, writers, and sweep.
pub(crate) struct ServerShared<S: RpcService> {
    pub config: Config,
    pub service: Arc<S>,
    pub registry: ConnectionRegistry,
    pub throttler: SizeThrottler,
    pub call_tx: mpsc::Sender<ServerCall<S::Request>>,
    pub call_rx: tokio::sync::Mutex<mpsc::Receiver<ServerCall<S::Request>>>,
    pub queued_calls: AtomicUsize,
    pub decode_permits: Semaphore,
    pub metrics: Arc<Metrics>,
    pub shutdown: broadcast::Sender<()>,
    exhaustion_policy: Mutex<Option<Arc<dyn ExhaustionPolicy>>>,
}

impl<S: RpcService> ServerShared<S> {
    /// Closes a connection: marks it closed, wakes its tasks, refunds every
    /// queued response to the throttler in one step, and drops it from the
    /// registry. Idempotent.
    pub(crate) fn close_connection(&self, conn: &Arc<Connection>, reason: &str) {
        if let Some(refund) = conn.begin_close() {
            if refund > 0 {
                self.throttler.decrease(refund);
            }
            self.registry.remove(conn);
            self.metrics
                .connections_active
                .set(self.registry.len() as f64);
            self.metrics
                .response_queue_bytes
                .set(self.throttler.current() as f64);
            tracing::debug!(
                "disconnecting client {}: {}; {} active connections",
                conn,
                reason,
                self.registry.len()
            );
        }
    }

    /// Runs one idle sweep. Non-forced sweeps only act above the
    /// idle-threshold and evict at most the configured cap.
    pub(crate) fn run_sweep(&self, force: bool) {
        let limits = &self.config.limits;
        if !force && self.registry.len() <= limits.idle_threshold {
            return;
        }
        let expired = self.registry.collect_expired(
            now_ms(),
            limits.max_idle_ms,
            limits.max_evictions_per_sweep,
            force,
        );
        for conn in expired {
            self.metrics.connections_evicted_total.inc();
            self.close_connection(&conn, "idle");
        }
    }
}

/// A bound RPC server.
///
/// `bind` claims the port; `run` serves until [`Server::shutdown`] is
/// called. Outstanding responses are not guaranteed to drain once shutdown
/// starts.
pub struct Server<S: RpcService> {
    shared: Arc<ServerShared<S>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
}

impl<S: RpcService> Server<S> {
    /// Binds the listen socket and assembles the server.
    pub async fn bind(config: Config, service: S) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;

        let listener = bind_listener(&config)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        let (call_tx, call_rx) = mpsc::channel(config.rpc.call_queue_capacity());
        let (shutdown, _) = broadcast::channel(1);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let metrics = Arc::new(Metrics::new()?);
        let decode_permits = Semaphore::new(config.rpc.effective_deserialize_parallelism());
        let throttler = SizeThrottler::new(config.limits.response_queues_max_bytes);

        let shared = Arc::new(ServerShared {
            config,
            service: Arc::new(service),
            registry: ConnectionRegistry::new(),
            throttler,
            call_tx,
            call_rx: tokio::sync::Mutex::new(call_rx),
            queued_calls: AtomicUsize::new(0),
            decode_permits,
            metrics,
            shutdown,
            exhaustion_policy: Mutex::new(None),
        });

        Ok(Self {
            shared,
            listener: Mutex::new(Some(listener)),
            local_addr,
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            stopped_tx,
            stopped_rx,
        })
    }

    /// Installs the resource-exhaustion policy.
    pub fn set_exhaustion_policy(&self, policy: Arc<dyn ExhaustionPolicy>) {
        *self.shared.exhaustion_policy.lock() = Some(policy);
    }

    /// Address the listener is bound to; reflects the chosen ephemeral port
    /// when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(ServerError::ShuttingDown)?;
        let mut shutdown_rx = self.shared.shutdown.subscribe();
        if self.shutdown_requested.load(Ordering::SeqCst) {
            self.finish_stop();
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("server listening on {}", self.local_addr);

        for worker in 0..self.shared.config.rpc.handler_count {
            tokio::spawn(handler_loop(self.shared.clone(), worker));
        }
        tokio::spawn(sweep_loop(self.shared.clone()));

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => accept_connection(&self.shared, stream, addr),
                    Err(err) if is_exhaustion(&err) => {
                        let action = match &*self.shared.exhaustion_policy.lock() {
                            Some(policy) => policy.on_exhaustion(&err),
                            None => ExhaustionAction::Continue,
                        };
                        match action {
                            ExhaustionAction::Exit => {
                                tracing::error!("resource exhaustion, exiting: {}", err);
                                break;
                            }
                            ExhaustionAction::Continue => {
                                tracing::warn!("resource exhaustion on accept: {}", err);
                                self.shared.run_sweep(true);
                                let pause = self.shared.config.limits.exhaustion_pause();
                                tokio::select! {
                                    _ = tokio::time::sleep(pause) => {}
                                    _ = shutdown_rx.recv() => break,
                                }
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!("accept error: {}", err);
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        drop(listener);
        self.finish_stop();
        tracing::info!("server on {} stopped", self.local_addr);
        Ok(())
    }

    fn finish_stop(&self) {
        let _ = self.shared.shutdown.send(());
        for conn in self.shared.registry.drain() {
            if let Some(refund) = conn.begin_close() {
                if refund > 0 {
                    self.shared.throttler.decrease(refund);
                }
            }
        }
        self.shared
            .metrics
            .connections_active
            .set(0.0);
        self.shared
            .metrics
            .response_queue_bytes
            .set(self.shared.throttler.current() as f64);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stopped_tx.send(true);
    }

    /// Requests shutdown. No new work is accepted afterwards.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _ = self.shared.shutdown.send(());
    }

    /// Waits until the server has fully stopped.
    pub async fn join(&self) {
        let mut stopped = self.stopped_rx.clone();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Calls waiting for a handler.
    pub fn call_queue_len(&self) -> usize {
        self.shared.queued_calls.load(Ordering::Relaxed)
    }

    /// Total bytes currently queued across all response queues.
    pub fn response_queue_bytes(&self) -> u64 {
        self.shared.throttler.current()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }
}

/// Builds the listen socket so the configured backlog applies.
fn bind_listener(config: &Config) -> Result<std::net::TcpListener, ServerError> {
    let addr = config.network.bind_addr;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::bind(addr, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ServerError::bind(addr, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::bind(addr, e))?;
    socket
        .listen(config.network.listen_backlog as i32)
        .map_err(|e| ServerError::bind(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::bind(addr, e))?;
    Ok(socket.into())
}

fn configure_socket(stream: &TcpStream, config: &Config) -> std::io::Result<()> {
    stream.set_nodelay(config.network.tcp_nodelay)?;
    let socket = socket2::SockRef::from(stream);
    socket.set_keepalive(config.network.tcp_keepalive)?;
    if config.network.send_buffer_bytes > 0 {
        socket.set_send_buffer_size(config.network.send_buffer_bytes)?;
    }
    Ok(())
}

/// Registers an accepted socket and spawns its read and write tasks.
fn accept_connection<S: RpcService>(
    shared: &Arc<ServerShared<S>>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    if let Err(err) = configure_socket(&stream, &shared.config) {
        tracing::warn!("failed to configure socket from {}: {}", addr, err);
        return;
    }

    let conn = Connection::new(addr);
    shared.registry.add(conn.clone());
    shared.metrics.connections_total.inc();
    shared
        .metrics
        .connections_active
        .set(shared.registry.len() as f64);
    tracing::trace!(
        "connection from {}; {} active connections",
        addr,
        shared.registry.len()
    );

    let (mut read_half, write_half) = stream.into_split();

    tokio::spawn(write_loop(shared.clone(), conn.clone(), write_half));

    let shared = shared.clone();
    tokio::spawn(async move {
        let reason = match read_loop(&shared, &conn, &mut read_half).await {
            Ok(()) => "peer disconnected",
            Err(ServerError::ShuttingDown) => "server stopping",
            Err(err) => {
                tracing::warn!("[{}] dropping connection: {}", conn, err);
                "read failed"
            }
        };
        shared.close_connection(&conn, reason);
    });
}

async fn sweep_loop<S: RpcService>(shared: Arc<ServerShared<S>>) {
    let mut shutdown = shared.shutdown.subscribe();
    let interval = shared.config.limits.sweep_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.recv() => return,
        }
        shared.run_sweep(false);
    }
}
