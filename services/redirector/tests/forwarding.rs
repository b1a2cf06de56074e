
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use harness::{
    accept_pair, closed_addr, make_handler, spawn_request_reply_backend, spawn_silent_backend,
    RecordingSink, TcpEchoBackend,
};
use plfm_redirector::telemetry::{TelemetrySettings, TunnelError};
use plfm_redirector::{
    config::PortRoute, ConnectionHandler, EventSink, HandlerConfig, ListenerWorker,
    SessionOutcome, StatusStore, TelemetryClient, TelemetryEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

const LISTEN_PORT: u16 = 9000;

async fn echo_roundtrip(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;
    stream.shutdown().await?;
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await?;
    Ok(received)
}

async fn wait_for_idle(store: &StatusStore, worker_id: usize) {
    timeout(Duration::from_secs(2), async {
        while store.worker(worker_id).map(|w| w.active_connections) != Some(0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("active connections did not return to zero");
}

#[tokio::test]
async fn clean_exchange_reports_lifecycle_after_both_directions() {
    let backend = spawn_request_reply_backend(1024, 2048).await.unwrap();
    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let handler = make_handler(
        LISTEN_PORT,
        backend,
        HandlerConfig::default(),
        &store,
        &sink,
    );

    let (mut client, server_side, peer) = accept_pair().await.unwrap();
    let session = tokio::spawn({
        let handler = Arc::clone(&handler);
        async move { handler.handle(server_side, peer).await }
    });

    client.write_all(&[b'q'; 1024]).await.unwrap();
    let mut reply = vec![0u8; 2048];
    client.read_exact(&mut reply).await.unwrap();
    assert!(reply.iter().all(|b| *b == b'r'));

    // Backend is done, client direction still open: nothing reported yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.events().is_empty());
    assert_eq!(store.worker(0).unwrap().active_connections, 1);

    client.shutdown().await.unwrap();
    let session = timeout(Duration::from_secs(2), session)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.outcome, SessionOutcome::ClosedClean);
    assert_eq!(session.bytes_in, 1024);
    assert_eq!(session.bytes_out, 2048);
    assert!(session.backend_dial_latency_ms.is_some());

    let counters = store.worker(0).unwrap();
    assert_eq!(counters.active_connections, 0);
    assert_eq!(counters.total_connections, 1);

    assert_eq!(sink.events().len(), 3);
    assert_eq!(sink.stream("web").len(), 1);
    assert_eq!(sink.stream("l2n").len(), 1);
    match &sink.stream("succeeded")[0] {
        TelemetryEvent::SucceededAccess(e) => {
            assert_eq!(e.port, LISTEN_PORT);
            assert_eq!(e.bytes_transferred, 3072);
            assert_eq!(e.backend_port, backend.port());
        }
        other => panic!("unexpected event {other:?}"),
    }
    match &sink.stream("web")[0] {
        TelemetryEvent::WebConnection(e) => {
            assert_eq!(e.client_port, peer.port());
            assert_eq!(e.bytes_in, 1024);
            assert_eq!(e.bytes_out, 2048);
            assert_eq!(e.worker_id, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn refused_backend_reports_tunnel_error() {
    let dead = closed_addr().await;
    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let handler = make_handler(LISTEN_PORT, dead, HandlerConfig::default(), &store, &sink);

    let (mut client, server_side, peer) = accept_pair().await.unwrap();
    let session = handler.handle(server_side, peer).await;

    assert_eq!(session.outcome, SessionOutcome::BackendUnreachable);
    assert_eq!(session.bytes_in, 0);
    assert!(session.backend_addr.is_none());

    let counters = store.worker(0).unwrap();
    assert_eq!(counters.active_connections, 0);
    assert_eq!(counters.total_connections, 0);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        TelemetryEvent::TunnelError(TunnelError {
            port,
            error_type,
            backend_ip,
            ..
        }) => {
            assert_eq!(*port, LISTEN_PORT);
            assert_eq!(error_type, "connection_refused");
            assert_eq!(backend_ip, "127.0.0.1");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Client socket was closed by the handler.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

// Linux drops SYNs once a listener's accept queue is full, so dials hang.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn saturated_backend_reports_dial_timeout() {
    let listener = plfm_redirector::proxy::bind_shared("127.0.0.1:0".parse().unwrap(), 0).unwrap();
    let backend = listener.local_addr().unwrap();

    let mut fillers = Vec::new();
    for _ in 0..8 {
        if let Ok(Ok(stream)) =
            timeout(Duration::from_millis(100), TcpStream::connect(backend)).await
        {
            fillers.push(stream);
        }
    }

    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let config = HandlerConfig {
        dial_timeout: Duration::from_millis(200),
        ..HandlerConfig::default()
    };
    let handler = make_handler(LISTEN_PORT, backend, config, &store, &sink);

    let (_client, server_side, peer) = accept_pair().await.unwrap();
    let started = std::time::Instant::now();
    let session = handler.handle(server_side, peer).await;

    assert!(started.elapsed() < Duration::from_millis(700));
    assert_eq!(session.outcome, SessionOutcome::BackendUnreachable);
    let errors = sink.stream("errors_l2n");
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        TelemetryEvent::TunnelError(e) => assert_eq!(e.error_type, "connection_timeout"),
        other => panic!("unexpected event {other:?}"),
    }
    drop(listener);
}

#[tokio::test]
async fn idle_session_times_out() {
    let backend = spawn_silent_backend().await.unwrap();
    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let config = HandlerConfig {
        idle_timeout: Duration::from_millis(150),
        ..HandlerConfig::default()
    };
    let handler = make_handler(LISTEN_PORT, backend, config, &store, &sink);

    let (mut client, server_side, peer) = accept_pair().await.unwrap();
    let session = timeout(Duration::from_secs(2), handler.handle(server_side, peer))
        .await
        .expect("idle session was not closed");

    assert_eq!(session.outcome, SessionOutcome::Timeout);
    assert_eq!(store.worker(0).unwrap().active_connections, 0);
    assert_eq!(sink.stream("succeeded").len(), 1);

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn client_reset_ends_session_as_error() {
    let backend = spawn_silent_backend().await.unwrap();
    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let handler = make_handler(
        LISTEN_PORT,
        backend,
        HandlerConfig::default(),
        &store,
        &sink,
    );

    let (mut client, server_side, peer) = accept_pair().await.unwrap();
    let session = tokio::spawn({
        let handler = Arc::clone(&handler);
        async move { handler.handle(server_side, peer).await }
    });

    client.write_all(b"x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.worker(0).unwrap().active_connections, 1);

    // Zero linger turns the close into an RST.
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(client);

    // The backend stays silent, so only the fault can stop the other direction
    // before the 300 s idle timeout.
    let session = timeout(Duration::from_secs(3), session)
        .await
        .expect("reset did not end the session")
        .unwrap();

    assert_eq!(session.outcome, SessionOutcome::ClosedError);
    assert_eq!(session.bytes_in, 1);
    assert_eq!(store.worker(0).unwrap().active_connections, 0);

    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(sink.stream("web").len(), 1);
    assert_eq!(sink.stream("l2n").len(), 1);
    assert_eq!(sink.stream("succeeded").len(), 1);
}

#[tokio::test]
async fn sequential_connections_balance_counters() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let handler = make_handler(
        LISTEN_PORT,
        backend.addr,
        HandlerConfig::default(),
        &store,
        &sink,
    );

    let worker = ListenerWorker::bind(
        "127.0.0.1:0".parse().unwrap(),
        128,
        handler,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    )
    .unwrap();
    let addr = worker.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(worker.run(shutdown_rx, Duration::from_secs(1)));

    const N: u64 = 20;
    for i in 0..N {
        let payload = format!("message-{i}");
        let received = echo_roundtrip(addr, payload.as_bytes()).await.unwrap();
        assert_eq!(received, payload.as_bytes());

        wait_for_idle(&store, 0).await;
        let counters = store.worker(0).unwrap();
        assert_eq!(counters.active_connections, 0);
        assert_eq!(counters.total_connections, i + 1);
    }

    assert_eq!(store.worker(0).unwrap().total_connections, N);
    assert_eq!(backend.connection_count(), N);

    shutdown_tx.send_replace(true);
    timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn stalled_backend_does_not_block_other_sessions() {
    let silent = spawn_silent_backend().await.unwrap();
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let dyn_sink = Arc::clone(&sink) as Arc<dyn EventSink>;

    let stalled_handler = Arc::new(ConnectionHandler::new(
        PortRoute::new(9001, silent.ip().to_string(), silent.port()),
        0,
        HandlerConfig::default(),
        Arc::clone(&store),
        Arc::clone(&dyn_sink),
    ));
    let echo_handler = Arc::new(ConnectionHandler::new(
        PortRoute::new(9002, echo.addr.ip().to_string(), echo.addr.port()),
        1,
        HandlerConfig::default(),
        Arc::clone(&store),
        Arc::clone(&dyn_sink),
    ));
    store.register_worker(0, 9001);
    store.register_worker(1, 9002);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stalled_worker = ListenerWorker::bind(
        "127.0.0.1:0".parse().unwrap(),
        128,
        stalled_handler,
        Arc::clone(&dyn_sink),
    )
    .unwrap();
    let echo_worker = ListenerWorker::bind(
        "127.0.0.1:0".parse().unwrap(),
        128,
        echo_handler,
        Arc::clone(&dyn_sink),
    )
    .unwrap();
    let stalled_addr = stalled_worker.local_addr().unwrap();
    let echo_addr = echo_worker.local_addr().unwrap();
    let grace = Duration::from_millis(100);
    tokio::spawn(stalled_worker.run(shutdown_rx.clone(), grace));
    tokio::spawn(echo_worker.run(shutdown_rx, grace));

    let mut stalled_clients = Vec::new();
    for _ in 0..5 {
        let mut stream = TcpStream::connect(stalled_addr).await.unwrap();
        stream.write_all(b"anyone there?").await.unwrap();
        stalled_clients.push(stream);
    }

    let received = timeout(
        Duration::from_secs(1),
        echo_roundtrip(echo_addr, b"still moving"),
    )
    .await
    .expect("healthy session was blocked")
    .unwrap();
    assert_eq!(received, b"still moving");

    shutdown_tx.send_replace(true);
}

#[tokio::test]
async fn forwarding_survives_unreachable_telemetry() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let dead_api = closed_addr().await;
    let store = Arc::new(StatusStore::new());
    store.register_worker(0, LISTEN_PORT);

    let client = TelemetryClient::new(TelemetrySettings {
        base_url: format!("http://{dead_api}"),
        token: "test-token".to_string(),
        timeout: Duration::from_millis(500),
        retries: 3,
        retry_delay: Duration::from_millis(200),
        max_in_flight: 16,
    })
    .unwrap();
    let handler = Arc::new(ConnectionHandler::new(
        PortRoute::new(LISTEN_PORT, "127.0.0.1", backend.addr.port()),
        0,
        HandlerConfig::default(),
        Arc::clone(&store),
        Arc::new(client.clone()),
    ));

    let (mut stream, server_side, peer) = accept_pair().await.unwrap();
    let session = tokio::spawn(async move { handler.handle(server_side, peer).await });

    stream.write_all(b"ping").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"ping");

    // Delivery would take several hundred ms of retries; the session must not wait.
    let session = timeout(Duration::from_millis(300), session)
        .await
        .expect("session waited on telemetry")
        .unwrap();
    assert_eq!(session.outcome, SessionOutcome::ClosedClean);
    assert_eq!(store.worker(0).unwrap().active_connections, 0);
    assert!(client.in_flight() > 0);
}

#[tokio::test]
async fn shutdown_stops_accepting_and_drains() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let store = Arc::new(StatusStore::new());
    let sink = RecordingSink::new();
    let handler = make_handler(
        LISTEN_PORT,
        backend.addr,
        HandlerConfig::default(),
        &store,
        &sink,
    );
    let worker = ListenerWorker::bind(
        "127.0.0.1:0".parse().unwrap(),
        128,
        handler,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    )
    .unwrap();
    let addr = worker.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(worker.run(shutdown_rx, Duration::from_millis(200)));

    // A session that stays open past the grace period.
    let mut lingering = TcpStream::connect(addr).await.unwrap();
    lingering.write_all(b"hold").await.unwrap();
    let mut buf = [0u8; 4];
    lingering.read_exact(&mut buf).await.unwrap();

    shutdown_tx.send_replace(true);
    timeout(Duration::from_secs(2), running)
        .await
        .expect("worker did not stop after grace period")
        .unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
    assert_eq!(store.worker(0).unwrap().active_connections, 0);
}
