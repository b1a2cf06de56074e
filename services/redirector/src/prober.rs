//! Backend and tunnel health probing.
//!
//! Every interval the prober opens a bare TCP connection to each backend and
//! to the tunnel endpoint, records the verdict in the status store and
//! reports it as telemetry. Results are advisory: sessions never consult
//! them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Endpoint, PortRoute};
use crate::proxy::millis_f64;
use crate::status::{EndpointHealth, HealthState, StatusStore};
use crate::telemetry::{EventSink, Severity, TelemetryEvent};

/// What a probe was aimed at.
#[derive(Debug, Clone)]
enum ProbeTarget {
    Port(PortRoute),
    Tunnel(Endpoint),
}

/// Periodic health prober.
pub struct Prober {
    routes: Vec<PortRoute>,
    tunnel: Endpoint,
    interval: Duration,
    probe_timeout: Duration,
    store: Arc<StatusStore>,
    sink: Arc<dyn EventSink>,
}

impl Prober {
    pub fn new(config: &Config, store: Arc<StatusStore>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_settings(
            config.routes.clone(),
            config.tunnel.clone(),
            config.probe_interval,
            config.probe_timeout,
            store,
            sink,
        )
    }

    pub fn with_settings(
        routes: Vec<PortRoute>,
        tunnel: Endpoint,
        interval: Duration,
        probe_timeout: Duration,
        store: Arc<StatusStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            routes,
            tunnel,
            interval,
            probe_timeout,
            store,
            sink,
        }
    }

    /// Probe every interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            routes = self.routes.len(),
            tunnel = %self.tunnel.target(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting health prober"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health prober shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe all targets once, concurrently.
    pub async fn run_cycle(&self) {
        let mut probes = JoinSet::new();
        let limit = self.probe_timeout;

        let targets = self
            .routes
            .iter()
            .cloned()
            .map(ProbeTarget::Port)
            .chain(std::iter::once(ProbeTarget::Tunnel(self.tunnel.clone())));

        for target in targets {
            probes.spawn(async move {
                let address = match &target {
                    ProbeTarget::Port(route) => route.backend_target(),
                    ProbeTarget::Tunnel(endpoint) => endpoint.target(),
                };
                let (status, latency_ms) = probe_tcp(&address, limit).await;
                (target, status, latency_ms)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((target, status, latency_ms)) => self.record(target, status, latency_ms),
                Err(e) => error!(error = %e, "Probe task failed"),
            }
        }
    }

    fn record(&self, target: ProbeTarget, status: HealthState, latency_ms: Option<f64>) {
        let health = EndpointHealth {
            status,
            latency_ms,
            last_checked: Utc::now(),
        };

        match target {
            ProbeTarget::Port(route) => {
                let port = route.listen_port;
                let previous = self.store.record_port_health(port, health);
                debug!(
                    port,
                    backend = %route.backend_target(),
                    status = status.as_str(),
                    latency_ms,
                    "Backend probed"
                );

                if previous == Some(HealthState::Up) && status == HealthState::Down {
                    let backend = route.backend_target();
                    warn!(port, backend = %backend, "Backend went down");
                    self.sink.dispatch(TelemetryEvent::warning(
                        port,
                        "backend_down",
                        format!("backend {backend} stopped accepting connections"),
                        Severity::High,
                    ));
                }

                self.sink.dispatch(TelemetryEvent::port_health(
                    port,
                    route.backend_host,
                    route.backend_port,
                    status,
                    latency_ms,
                ));
            }
            ProbeTarget::Tunnel(endpoint) => {
                self.store.record_tunnel_health(health);
                debug!(
                    tunnel = %endpoint.target(),
                    status = status.as_str(),
                    latency_ms,
                    "Tunnel probed"
                );
                self.sink.dispatch(TelemetryEvent::tunnel_health(
                    endpoint.host,
                    endpoint.port,
                    status,
                    latency_ms,
                ));
            }
        }
    }
}

/// Bare TCP reachability check bounded by `limit`.
pub async fn probe_tcp(address: &str, limit: Duration) -> (HealthState, Option<f64>) {
    let started = Instant::now();
    match timeout(limit, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => (HealthState::Up, Some(millis_f64(started.elapsed()))),
        Ok(Err(e)) => {
            debug!(address, error = %e, "Probe connect failed");
            (HealthState::Down, None)
        }
        Err(_) => {
            debug!(address, timeout_ms = limit.as_millis() as u64, "Probe timed out");
            (HealthState::Down, None)
        }
    }
}
