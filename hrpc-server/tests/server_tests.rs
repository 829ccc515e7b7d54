//! End-to-end tests over a real socket.

use hrpc_server::{CallContext, Config, RpcService, Server, ServiceError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Minimal wire-level client for driving the server in tests.
mod wire_client {
    use super::TestResult;
    use bytes::BytesMut;
    use hrpc_protocol::{frame, CallOptions, RequestFrame, ResponseFrame};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpSocket, TcpStream};

    pub struct TestClient {
        stream: TcpStream,
        buf: BytesMut,
        version: u8,
    }

    impl TestClient {
        pub async fn connect(addr: SocketAddr, version: u8, identity: &[u8]) -> TestResult<Self> {
            Self::connect_with(addr, version, identity, None).await
        }

        /// `recv_buffer` shrinks the socket receive buffer before connecting,
        /// for tests that need a slow client.
        pub async fn connect_with(
            addr: SocketAddr,
            version: u8,
            identity: &[u8],
            recv_buffer: Option<u32>,
        ) -> TestResult<Self> {
            let socket = TcpSocket::new_v4()?;
            if let Some(size) = recv_buffer {
                socket.set_recv_buffer_size(size)?;
            }
            let stream = socket.connect(addr).await?;
            stream.set_nodelay(true)?;

            let mut hello = BytesMut::new();
            frame::encode_preamble(&mut hello, version);
            frame::encode_frame(&mut hello, identity);
            let mut client = Self {
                stream,
                buf: BytesMut::new(),
                version,
            };
            client.stream.write_all(&hello).await?;
            Ok(client)
        }

        pub async fn send_call(
            &mut self,
            call_id: i32,
            options: &CallOptions,
            request: &str,
        ) -> TestResult {
            let payload =
                RequestFrame::encode(call_id, self.version, options, &request.to_string())?;
            let mut framed = BytesMut::new();
            frame::encode_frame(&mut framed, &payload);
            self.stream.write_all(&framed).await?;
            Ok(())
        }

        pub async fn send_ping(&mut self) -> TestResult {
            let mut buf = BytesMut::new();
            frame::encode_ping(&mut buf);
            self.stream.write_all(&buf).await?;
            Ok(())
        }

        pub async fn send_raw(&mut self, bytes: &[u8]) -> TestResult {
            self.stream.write_all(bytes).await?;
            Ok(())
        }

        pub async fn recv_response(&mut self) -> TestResult<ResponseFrame<String>> {
            self.recv_response_timeout(Duration::from_secs(5)).await
        }

        pub async fn recv_response_timeout(
            &mut self,
            timeout: Duration,
        ) -> TestResult<ResponseFrame<String>> {
            tokio::time::timeout(timeout, async {
                loop {
                    if let Some(frame) =
                        ResponseFrame::<String>::try_parse(&mut self.buf, self.version)?
                    {
                        return Ok(frame);
                    }
                    let n = self.stream.read_buf(&mut self.buf).await?;
                    if n == 0 {
                        return Err("connection closed by server".into());
                    }
                }
            })
            .await
            .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> {
                "timed out waiting for response".into()
            })?
        }

        /// Waits for the server to close the connection, discarding anything
        /// it sends first.
        pub async fn expect_close(&mut self, timeout: Duration) -> TestResult {
            tokio::time::timeout(timeout, async {
                let mut sink = [0u8; 4096];
                loop {
                    match self.stream.read(&mut sink).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            })
            .await
            .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> {
                "timed out waiting for close".into()
            })?;
            Ok(())
        }
    }
}

use hrpc_protocol::{Algorithm, CallOptions, ResponseBody, CURRENT_VERSION, VERSION_3};
use wire_client::TestClient;

#[derive(Default)]
struct ServiceState {
    calls: AtomicUsize,
    dispatch_order: Mutex<Vec<String>>,
}

/// Dispatcher with a few behaviors keyed off the request string.
struct TestService {
    state: Arc<ServiceState>,
}

impl RpcService for TestService {
    type Request = String;
    type Response = String;

    fn call(&self, request: String, ctx: &mut CallContext) -> Result<String, ServiceError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state.dispatch_order.lock().unwrap().push(request.clone());

        if request == "ping" {
            return Ok("pong".to_string());
        }
        if request == "boom" {
            return Err(ServiceError::new("IllegalArgument", "bad"));
        }
        if request == "whoami" {
            return Ok(String::from_utf8_lossy(ctx.identity()).into_owned());
        }
        if request == "tag" {
            return Ok(ctx.tag().unwrap_or("<none>").to_string());
        }
        if let Some(ms) = request.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap();
            std::thread::sleep(Duration::from_millis(ms));
            return Ok(format!("slept:{ms}"));
        }
        if let Some(size) = request.strip_prefix("blob:") {
            let size: usize = size.parse().unwrap();
            ctx.charge_response_bytes(size as u64)?;
            return Ok("x".repeat(size));
        }
        Ok(request)
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.network.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.rpc.handler_count = 4;
    config
}

async fn start_server(
    config: Config,
) -> (Arc<Server<TestService>>, Arc<ServiceState>, tokio::task::JoinHandle<()>) {
    let state = Arc::new(ServiceState::default());
    let service = TestService {
        state: state.clone(),
    };
    let server = Arc::new(Server::bind(config, service).await.expect("bind"));
    let handle = {
        let server = server.clone();
        tokio::spawn(async move {
            server.run().await.expect("server run");
        })
    };
    (server, state, handle)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_echo_roundtrip() -> TestResult {
    let (server, state, _handle) = start_server(test_config()).await;
    assert_eq!(server.response_queue_bytes(), 0);

    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;
    client.send_call(7, &CallOptions::default(), "ping").await?;

    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 7);
    assert_eq!(response.algorithm, Algorithm::None);
    assert_eq!(
        response.body,
        ResponseBody::Success {
            response: "pong".to_string(),
            profiling: None
        }
    );
    assert_eq!(state.calls.load(Ordering::SeqCst), 1);

    wait_until("byte counter to drain", || server.response_queue_bytes() == 0).await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_compressed_response() -> TestResult {
    let (server, _state, _handle) = start_server(test_config()).await;
    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;

    let options = CallOptions::default().with_rx_compression(Algorithm::Gz);
    client.send_call(7, &options, "blob:5000").await?;

    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 7);
    assert_eq!(response.algorithm, Algorithm::Gz);
    match response.body {
        ResponseBody::Success { response, .. } => assert_eq!(response, "x".repeat(5000)),
        other => panic!("expected success, got {other:?}"),
    }
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compressed_request_body_is_decoded() -> TestResult {
    let (server, state, _handle) = start_server(test_config()).await;
    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;

    let options = CallOptions::default().with_tx_compression(Algorithm::Gz);
    client.send_call(1, &options, "ping").await?;

    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 1);
    match response.body {
        ResponseBody::Success { response, .. } => assert_eq!(response, "pong"),
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(state.calls.load(Ordering::SeqCst), 1);
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_error_response_keeps_connection_open() -> TestResult {
    let (server, _state, _handle) = start_server(test_config()).await;
    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;

    client.send_call(7, &CallOptions::default(), "boom").await?;
    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 7);
    assert_eq!(
        response.body,
        ResponseBody::Error {
            class: "IllegalArgument".to_string(),
            message: "bad".to_string(),
        }
    );

    // Same connection keeps working.
    client.send_call(8, &CallOptions::default(), "ping").await?;
    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 8);
    assert!(matches!(response.body, ResponseBody::Success { .. }));
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_bad_magic_drops_connection() -> TestResult {
    let (server, state, _handle) = start_server(test_config()).await;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut raw = tokio::net::TcpStream::connect(server.local_addr()).await?;
    raw.write_all(b"xxxx\x04garbage").await?;

    let mut sink = [0u8; 64];
    let closed = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut sink)).await;
    assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));

    wait_until("registry to empty", || server.open_connections() == 0).await;
    assert_eq!(state.calls.load(Ordering::SeqCst), 0);
    assert_eq!(server.response_queue_bytes(), 0);
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_frame_drops_connection_without_dispatch() -> TestResult {
    let mut config = test_config();
    config.limits.max_request_bytes = 1024;
    let (server, state, _handle) = start_server(config).await;

    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;
    // Length prefix claiming 2 MB.
    client.send_raw(&2_000_000i32.to_be_bytes()).await?;
    client.expect_close(Duration::from_secs(5)).await?;

    assert_eq!(state.calls.load(Ordering::SeqCst), 0);
    wait_until("registry to empty", || server.open_connections() == 0).await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelined_calls_dispatch_in_arrival_order() -> TestResult {
    let mut config = test_config();
    config.rpc.handler_count = 1;
    let (server, state, _handle) = start_server(config).await;

    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;
    let sent: Vec<String> = (0..20).map(|i| format!("seq:{i}")).collect();
    for (i, request) in sent.iter().enumerate() {
        client
            .send_call(i as i32, &CallOptions::default(), request)
            .await?;
    }
    for _ in 0..sent.len() {
        client.recv_response().await?;
    }

    assert_eq!(*state.dispatch_order.lock().unwrap(), sent);
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn responses_are_emitted_in_completion_order() -> TestResult {
    let mut config = test_config();
    config.rpc.handler_count = 2;
    let (server, _state, _handle) = start_server(config).await;

    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;
    client
        .send_call(1, &CallOptions::default(), "sleep:500")
        .await?;
    client.send_call(2, &CallOptions::default(), "ping").await?;

    // Call 2 completes first, so its frame goes out first; the client must
    // reassociate by id.
    let first = client.recv_response().await?;
    assert_eq!(first.call_id, 2);
    let second = client.recv_response().await?;
    assert_eq!(second.call_id, 1);
    match second.body {
        ResponseBody::Success { response, .. } => assert_eq!(response, "slept:500"),
        other => panic!("expected success, got {other:?}"),
    }
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_is_never_dispatched() -> TestResult {
    let (server, state, _handle) = start_server(test_config()).await;
    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;

    for _ in 0..3 {
        client.send_ping().await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state.calls.load(Ordering::SeqCst), 0);
    assert_eq!(server.call_queue_len(), 0);

    // The connection is still healthy afterwards.
    client.send_call(1, &CallOptions::default(), "ping").await?;
    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 1);
    assert_eq!(state.calls.load(Ordering::SeqCst), 1);
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn version_3_client_exchanges_calls() -> TestResult {
    let (server, _state, _handle) = start_server(test_config()).await;
    let mut client = TestClient::connect(server.local_addr(), VERSION_3, b"legacy-user").await?;

    client.send_call(5, &CallOptions::default(), "ping").await?;
    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 5);
    assert_eq!(response.algorithm, Algorithm::None);
    assert_eq!(
        response.body,
        ResponseBody::Success {
            response: "pong".to_string(),
            profiling: None
        }
    );
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn profiling_data_returns_with_response() -> TestResult {
    let (server, _state, _handle) = start_server(test_config()).await;
    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;

    let options = CallOptions::default().with_profiling();
    client.send_call(3, &options, "sleep:30").await?;
    let response = client.recv_response().await?;
    match response.body {
        ResponseBody::Success {
            profiling: Some(profiling),
            ..
        } => {
            let total = profiling
                .get(hrpc_protocol::profiling::TOTAL_SERVER_TIME_MS)
                .expect("total time recorded");
            assert!(total >= 30, "expected >= 30ms, got {total}");
        }
        other => panic!("expected profiled success, got {other:?}"),
    }
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_and_tag_reach_the_dispatcher() -> TestResult {
    let (server, _state, _handle) = start_server(test_config()).await;
    let mut client = TestClient::connect(server.local_addr(), CURRENT_VERSION, b"alice").await?;

    client.send_call(1, &CallOptions::default(), "whoami").await?;
    let response = client.recv_response().await?;
    match response.body {
        ResponseBody::Success { response, .. } => assert_eq!(response, "alice"),
        other => panic!("expected success, got {other:?}"),
    }

    let options = CallOptions::default().with_tag("scanner");
    client.send_call(2, &options, "tag").await?;
    let response = client.recv_response().await?;
    match response.body {
        ResponseBody::Success { response, .. } => assert_eq!(response, "scanner"),
        other => panic!("expected success, got {other:?}"),
    }
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn response_quota_is_an_error_not_a_disconnect() -> TestResult {
    let mut config = test_config();
    config.limits.max_response_bytes = 1000;
    let (server, _state, _handle) = start_server(config).await;

    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;
    client
        .send_call(1, &CallOptions::default(), "blob:5000")
        .await?;
    let response = client.recv_response().await?;
    match response.body {
        ResponseBody::Error { class, .. } => {
            assert_eq!(class, hrpc_server::service::RESPONSE_TOO_LARGE_CLASS)
        }
        other => panic!("expected quota error, got {other:?}"),
    }

    client.send_call(2, &CallOptions::default(), "ping").await?;
    let response = client.recv_response().await?;
    assert_eq!(response.call_id, 2);
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_throttler_caps_queued_response_bytes() -> TestResult {
    let mut config = test_config();
    config.limits.response_queues_max_bytes = 100_000;
    config.network.send_buffer_bytes = 4096;
    let (server, _state, _handle) = start_server(config).await;

    let mut client = TestClient::connect_with(
        server.local_addr(),
        CURRENT_VERSION,
        b"slow-client",
        Some(8192),
    )
    .await?;

    // Each response is ~60 KB; two of them cannot be queued at once, so the
    // second producing handler blocks in the throttler while the writer is
    // stuck against a full client receive window.
    for id in 0..4 {
        client
            .send_call(id, &CallOptions::default(), "blob:60000")
            .await?;
    }

    wait_until("first response to be queued", || {
        server.response_queue_bytes() > 0
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let peak = server.response_queue_bytes();
    assert!(peak > 0, "a response should still be queued");
    assert!(
        peak <= 100_000,
        "queued bytes {peak} exceeded the configured ceiling"
    );

    // Once the client drains, every response arrives and the counter closes
    // back to zero.
    for _ in 0..4 {
        let response = client.recv_response_timeout(Duration::from_secs(10)).await?;
        assert!(matches!(response.body, ResponseBody::Success { .. }));
        assert!(server.response_queue_bytes() <= 100_000);
    }
    wait_until("byte counter to drain", || server.response_queue_bytes() == 0).await;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_queue_is_bounded() -> TestResult {
    let mut config = test_config();
    config.rpc.handler_count = 1;
    config.rpc.handler_queue_limit = 2;
    let (server, _state, _handle) = start_server(config).await;

    let mut client =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"test-user").await?;
    // Occupy the single handler, then pile up calls behind it.
    client
        .send_call(0, &CallOptions::default(), "sleep:1000")
        .await?;
    for id in 1..10 {
        client.send_call(id, &CallOptions::default(), "ping").await?;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        server.call_queue_len() <= 2,
        "queue length {} exceeded its bound",
        server.call_queue_len()
    );

    for _ in 0..10 {
        client.recv_response_timeout(Duration::from_secs(10)).await?;
    }
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s6_stalled_response_purges_connection() -> TestResult {
    let mut config = test_config();
    config.rpc.purge_interval_ms = 400;
    config.network.send_buffer_bytes = 4096;
    let (server, _state, _handle) = start_server(config).await;

    let mut client = TestClient::connect_with(
        server.local_addr(),
        CURRENT_VERSION,
        b"stalled-client",
        Some(8192),
    )
    .await?;
    client
        .send_call(1, &CallOptions::default(), "blob:60000")
        .await?;

    // The client never reads, so the head response cannot drain and the
    // purge closes the connection.
    wait_until("stalled connection to be purged", || {
        server.open_connections() == 0
    })
    .await;
    wait_until("purged bytes to be refunded", || {
        server.response_queue_bytes() == 0
    })
    .await;
    client.expect_close(Duration::from_secs(5)).await?;
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_connections_are_swept_but_active_ones_stay() -> TestResult {
    let mut config = test_config();
    config.limits.idle_threshold = 1;
    config.limits.max_idle_ms = 200;
    config.limits.sweep_interval_ms = 100;
    let (server, _state, _handle) = start_server(config).await;

    let _idle_a = TestClient::connect(server.local_addr(), CURRENT_VERSION, b"idle-a").await?;
    let _idle_b = TestClient::connect(server.local_addr(), CURRENT_VERSION, b"idle-b").await?;
    let _idle_c = TestClient::connect(server.local_addr(), CURRENT_VERSION, b"idle-c").await?;
    let mut active = TestClient::connect(server.local_addr(), CURRENT_VERSION, b"active").await?;
    wait_until("all connections registered", || server.open_connections() == 4).await;

    // Keep one connection warm with keepalives while the others idle out.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        active.send_ping().await?;
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    assert_eq!(server.open_connections(), 1);
    active.send_call(1, &CallOptions::default(), "ping").await?;
    let response = active.recv_response().await?;
    assert_eq!(response.call_id, 1);
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn byte_accounting_closes_to_zero_after_stop() -> TestResult {
    let mut config = test_config();
    config.network.send_buffer_bytes = 4096;
    let (server, _state, handle) = start_server(config).await;

    // One drained call and one stalled response at shutdown time.
    let mut drained =
        TestClient::connect(server.local_addr(), CURRENT_VERSION, b"drained").await?;
    drained.send_call(1, &CallOptions::default(), "ping").await?;
    drained.recv_response().await?;

    let mut stalled = TestClient::connect_with(
        server.local_addr(),
        CURRENT_VERSION,
        b"stalled",
        Some(8192),
    )
    .await?;
    stalled
        .send_call(2, &CallOptions::default(), "blob:60000")
        .await?;
    wait_until("stalled response to be queued", || {
        server.response_queue_bytes() > 0
    })
    .await;

    server.shutdown();
    server.join().await;
    handle.await?;

    wait_until("all bytes to be refunded", || {
        server.response_queue_bytes() == 0
    })
    .await;
    assert_eq!(server.open_connections(), 0);
    Ok(())
}
