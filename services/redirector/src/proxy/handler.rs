//! Connection handling.
//!
//! A `ConnectionHandler` owns one client session end to end: it dials the
//! backend, relays both directions, keeps the worker counters straight and
//! emits the lifecycle telemetry once both directions are done.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::forward::{relay, DirectionEnd, RelayResult};
use crate::config::{Config, PortRoute};
use crate::error::DialError;
use crate::status::{StatusStore, WorkerId};
use crate::telemetry::{EventSink, Severity, TelemetryEvent};

/// Default backend dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default per-read idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default forwarding buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default dial latency that triggers a `high_latency` warning.
pub const DEFAULT_HIGH_LATENCY_THRESHOLD: Duration = Duration::from_millis(1000);

/// Tunables for connection handling.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Backend connect timeout.
    pub dial_timeout: Duration,
    /// Per-read (and per-write) idle timeout of each direction.
    pub idle_timeout: Duration,
    /// Forwarding buffer size per direction.
    pub buffer_size: usize,
    /// Dial latency above which a `high_latency` warning is sent.
    pub high_latency_threshold: Duration,
}

impl HandlerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dial_timeout: config.dial_timeout,
            idle_timeout: config.idle_timeout,
            buffer_size: config.buffer_size,
            high_latency_threshold: config.high_latency_threshold,
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            high_latency_threshold: DEFAULT_HIGH_LATENCY_THRESHOLD,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Open,
    ClosedClean,
    ClosedError,
    Timeout,
    BackendUnreachable,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Open => "open",
            SessionOutcome::ClosedClean => "closed_clean",
            SessionOutcome::ClosedError => "closed_error",
            SessionOutcome::Timeout => "timeout",
            SessionOutcome::BackendUnreachable => "backend_unreachable",
        }
    }

    fn from_relay(result: &RelayResult) -> Self {
        let ends = [result.upstream.end, result.downstream.end];
        if ends
            .iter()
            .any(|e| matches!(e, DirectionEnd::Error | DirectionEnd::Aborted))
        {
            SessionOutcome::ClosedError
        } else if ends.contains(&DirectionEnd::IdleTimeout) {
            SessionOutcome::Timeout
        } else {
            SessionOutcome::ClosedClean
        }
    }
}

/// One client <-> backend relay.
///
/// Byte counts are advisory: `bytes_in` is client to backend, `bytes_out`
/// is backend to client.
#[derive(Debug, Clone)]
pub struct Session {
    /// Accepted client address.
    pub client_addr: SocketAddr,
    /// Resolved backend address; `None` until the dial succeeds.
    pub backend_addr: Option<SocketAddr>,
    /// Port the client connected to.
    pub listen_port: u16,
    /// Worker that accepted the client.
    pub worker_id: WorkerId,
    /// When the client was accepted.
    pub start_time: Instant,
    /// Backend dial latency; `None` if the dial failed.
    pub backend_dial_latency_ms: Option<f64>,
    /// Bytes forwarded client to backend.
    pub bytes_in: u64,
    /// Bytes forwarded backend to client.
    pub bytes_out: u64,
    /// How the session ended, `Open` while relaying.
    pub outcome: SessionOutcome,
}

impl Session {
    fn new(client_addr: SocketAddr, listen_port: u16, worker_id: WorkerId) -> Self {
        Self {
            client_addr,
            backend_addr: None,
            listen_port,
            worker_id,
            start_time: Instant::now(),
            backend_dial_latency_ms: None,
            bytes_in: 0,
            bytes_out: 0,
            outcome: SessionOutcome::Open,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// Handles sessions for one (port, backend) pair on one worker.
pub struct ConnectionHandler {
    route: PortRoute,
    worker_id: WorkerId,
    config: HandlerConfig,
    store: Arc<StatusStore>,
    sink: Arc<dyn EventSink>,
}

impl ConnectionHandler {
    pub fn new(
        route: PortRoute,
        worker_id: WorkerId,
        config: HandlerConfig,
        store: Arc<StatusStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            route,
            worker_id,
            config,
            store,
            sink,
        }
    }

    pub fn route(&self) -> &PortRoute {
        &self.route
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Run one session to completion.
    ///
    /// Never fails: every error ends the session and is reported through
    /// logs and telemetry. Both sockets are dropped before this returns.
    pub async fn handle(&self, mut client: TcpStream, client_addr: SocketAddr) -> Session {
        let port = self.route.listen_port;
        let mut session = Session::new(client_addr, port, self.worker_id);

        let (mut backend, latency) = match self.dial().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(
                    port,
                    worker_id = self.worker_id,
                    client = %client_addr,
                    error_type = e.error_type(),
                    error = %e,
                    "Backend dial failed"
                );
                session.outcome = SessionOutcome::BackendUnreachable;
                self.sink.dispatch(TelemetryEvent::tunnel_error(
                    port,
                    e.error_type(),
                    self.route.backend_host.clone(),
                    e.to_string(),
                ));
                return session;
            }
        };

        let latency_ms = millis_f64(latency);
        session.backend_dial_latency_ms = Some(latency_ms);
        session.backend_addr = backend.peer_addr().ok();
        let _ = client.set_nodelay(true);
        let _ = backend.set_nodelay(true);

        let active = self.store.track_connection(self.worker_id);

        info!(
            event = "NEW",
            port,
            worker_id = self.worker_id,
            client = %client_addr,
            backend = %self.route.backend_target(),
            latency_ms,
            "Session opened"
        );

        if latency > self.config.high_latency_threshold {
            self.sink.dispatch(TelemetryEvent::warning(
                port,
                "high_latency",
                format!(
                    "backend {} took {:.1}ms to accept",
                    self.route.backend_target(),
                    latency_ms
                ),
                Severity::Medium,
            ));
        }

        let result = relay(
            &mut client,
            &mut backend,
            self.config.buffer_size,
            self.config.idle_timeout,
        )
        .await;

        session.bytes_in = result.upstream.bytes;
        session.bytes_out = result.downstream.bytes;
        session.outcome = SessionOutcome::from_relay(&result);

        drop(backend);
        drop(client);
        drop(active);

        let duration_ms = session.duration_ms();
        info!(
            event = "CLOSED",
            port,
            worker_id = self.worker_id,
            client = %client_addr,
            outcome = session.outcome.as_str(),
            bytes_in = session.bytes_in,
            bytes_out = session.bytes_out,
            duration_ms,
            "Session closed"
        );
        debug!(
            upstream = ?result.upstream.end,
            downstream = ?result.downstream.end,
            "Direction ends"
        );

        self.emit_lifecycle(&session, duration_ms);
        session
    }

    async fn dial(&self) -> Result<(TcpStream, Duration), DialError> {
        let target = self.route.backend_target();
        let started = Instant::now();

        match timeout(self.config.dial_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => Ok((stream, started.elapsed())),
            Ok(Err(e)) => Err(DialError::from_io(target, e)),
            Err(_) => Err(DialError::Timeout {
                target,
                timeout_ms: self.config.dial_timeout.as_millis() as u64,
            }),
        }
    }

    fn emit_lifecycle(&self, session: &Session, duration_ms: u64) {
        let port = session.listen_port;
        let client_ip = session.client_addr.ip().to_string();
        let client_port = session.client_addr.port();
        let backend_ip = session
            .backend_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| self.route.backend_host.clone());
        let backend_port = session
            .backend_addr
            .map(|a| a.port())
            .unwrap_or(self.route.backend_port);

        self.sink.dispatch(TelemetryEvent::web_connection(
            port,
            client_ip.clone(),
            client_port,
            session.bytes_in,
            session.bytes_out,
            duration_ms,
            session.worker_id,
        ));
        self.sink.dispatch(TelemetryEvent::tunnel_connection(
            port,
            backend_ip.clone(),
            backend_port,
            session.bytes_in,
            session.bytes_out,
            duration_ms,
            session.backend_dial_latency_ms.unwrap_or_default(),
            session.worker_id,
        ));
        self.sink.dispatch(TelemetryEvent::succeeded_access(
            port,
            client_ip,
            client_port,
            backend_ip,
            backend_port,
            session.bytes_in + session.bytes_out,
            duration_ms,
        ));
    }
}

pub(crate) fn millis_f64(d: Duration) -> f64 {
    (d.as_secs_f64() * 100_000.0).round() / 100.0
}
