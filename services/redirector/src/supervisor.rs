//! Process supervision.
//!
//! Launches the prober, the status server and `ports × workers_per_port`
//! listener workers, watches them, and tears everything down on shutdown.
//! A unit that exits on its own is reported once and left down; the
//! supervisor keeps running with the remaining units.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::prober::Prober;
use crate::proxy::{ConnectionHandler, HandlerConfig, ListenerWorker};
use crate::server::{self, StatusState};
use crate::status::{StatusStore, WorkerId};
use crate::telemetry::{EventSink, TelemetryClient, TelemetrySettings};

/// How often unit liveness is checked.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between worker launches.
const LAUNCH_STAGGER: Duration = Duration::from_millis(10);

/// Raise the soft open-file limit toward `target`.
///
/// If `target` is above the hard limit, raising the hard limit is attempted
/// first (needs privileges); otherwise the soft limit is raised as far as the
/// hard limit allows. Returns the soft limit now in effect.
#[cfg(unix)]
pub fn raise_fd_limit(target: u64) -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let target = target as libc::rlim_t;
    if target <= limit.rlim_cur {
        return Ok(limit.rlim_cur as u64);
    }

    if target > limit.rlim_max {
        let raised = libc::rlimit {
            rlim_cur: target,
            rlim_max: target,
        };
        // SAFETY: setrlimit only reads the struct we pass.
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } == 0 {
            return Ok(target as u64);
        }
    }

    let capped = libc::rlimit {
        rlim_cur: target.min(limit.rlim_max),
        rlim_max: limit.rlim_max,
    };
    // SAFETY: setrlimit only reads the struct we pass.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &capped) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(capped.rlim_cur as u64)
}

#[cfg(not(unix))]
pub fn raise_fd_limit(_target: u64) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "file descriptor limits are not adjustable on this platform",
    ))
}

/// A launched task the supervisor watches.
struct Unit {
    name: String,
    handle: JoinHandle<()>,
    exited: bool,
}

/// Running set of units.
pub struct Supervisor {
    units: Vec<Unit>,
    shutdown_tx: watch::Sender<bool>,
    store: Arc<StatusStore>,
    worker_addrs: Vec<(WorkerId, SocketAddr)>,
    grace: Duration,
}

impl Supervisor {
    /// Bind every worker socket, then launch all units.
    ///
    /// Binding happens before anything is spawned so a bad port fails
    /// startup without leaving half the units running.
    pub async fn launch(config: &Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let listen_ip: IpAddr = config
            .listen_host
            .parse()
            .with_context(|| format!("Invalid listen host {:?}", config.listen_host))?;

        let store = Arc::new(StatusStore::new());
        let handler_config = HandlerConfig::from_config(config);

        let mut workers = Vec::new();
        let mut worker_id: WorkerId = 0;
        for route in &config.routes {
            let addr = SocketAddr::new(listen_ip, route.listen_port);
            for _ in 0..config.workers_per_port {
                let handler = Arc::new(ConnectionHandler::new(
                    route.clone(),
                    worker_id,
                    handler_config.clone(),
                    Arc::clone(&store),
                    Arc::clone(&sink),
                ));
                let worker = ListenerWorker::bind(addr, config.backlog, handler, Arc::clone(&sink))
                    .with_context(|| format!("Failed to bind worker {worker_id} on {addr}"))?;
                store.register_worker(worker_id, route.listen_port);
                workers.push(worker);
                worker_id += 1;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut units = Vec::new();

        let prober = Prober::new(config, Arc::clone(&store), Arc::clone(&sink));
        let prober_shutdown = shutdown_rx.clone();
        units.push(Unit {
            name: "prober".to_string(),
            handle: tokio::spawn(async move { prober.run(prober_shutdown).await }),
            exited: false,
        });

        let status_state = StatusState::new(Arc::clone(&store), config);
        let status_addr = config.status_addr;
        let status_shutdown = shutdown_rx.clone();
        units.push(Unit {
            name: "status-server".to_string(),
            handle: tokio::spawn(async move {
                if let Err(e) = server::serve(status_addr, status_state, status_shutdown).await {
                    error!(error = %e, "Status server exited with error");
                }
            }),
            exited: false,
        });

        let mut worker_addrs = Vec::with_capacity(workers.len());
        for worker in workers {
            let id = worker.worker_id();
            let addr = worker.local_addr()?;
            worker_addrs.push((id, addr));

            let worker_shutdown = shutdown_rx.clone();
            let grace = config.shutdown_grace;
            units.push(Unit {
                name: format!("worker-{id}:{}", addr.port()),
                handle: tokio::spawn(async move { worker.run(worker_shutdown, grace).await }),
                exited: false,
            });
            tokio::time::sleep(LAUNCH_STAGGER).await;
        }

        info!(
            ports = config.routes.len(),
            workers = worker_addrs.len(),
            status_addr = %config.status_addr,
            "All units launched"
        );

        Ok(Self {
            units,
            shutdown_tx,
            store,
            worker_addrs,
            grace: config.shutdown_grace,
        })
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    /// Bound address of every worker.
    pub fn worker_addrs(&self) -> &[(WorkerId, SocketAddr)] {
        &self.worker_addrs
    }

    /// Report units that exited since the last check; returns how many are
    /// still running. Exited units are not restarted.
    pub fn check_units(&mut self) -> usize {
        for unit in self.units.iter_mut().filter(|u| !u.exited) {
            if unit.handle.is_finished() {
                unit.exited = true;
                warn!(unit = %unit.name, "Unit exited unexpectedly; continuing without it");
            }
        }
        self.units.iter().filter(|u| !u.exited).count()
    }

    /// Stop every unit: signal, wait out the grace period, abort stragglers.
    pub async fn shutdown(self) {
        info!(units = self.units.len(), "Shutting down units");
        self.shutdown_tx.send_replace(true);

        // Workers spend up to `grace` draining sessions; allow them to finish.
        let deadline = Instant::now() + self.grace + Duration::from_secs(1);
        for mut unit in self.units {
            if unit.exited {
                continue;
            }
            if timeout_at(deadline, &mut unit.handle).await.is_err() {
                warn!(unit = %unit.name, "Unit did not stop in time, aborting");
                unit.handle.abort();
            }
        }
        info!("All units stopped");
    }
}

/// Run the redirector until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    match raise_fd_limit(config.fd_limit) {
        Ok(limit) => info!(limit, target = config.fd_limit, "Open file limit set"),
        Err(e) => warn!(error = %e, target = config.fd_limit, "Could not raise open file limit"),
    }

    if config.api_token.is_empty() {
        warn!("REDIRECTOR_API_TOKEN is empty; telemetry will be sent unauthenticated");
    }

    let telemetry = TelemetryClient::new(TelemetrySettings::from_config(&config))?;
    let sink: Arc<dyn EventSink> = Arc::new(telemetry);

    let mut supervisor = Supervisor::launch(&config, sink).await?;

    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    liveness.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = liveness.tick() => {
                let running = supervisor.check_units();
                if running == 0 {
                    error!("No units left running");
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
