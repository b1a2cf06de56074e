//! Shared status store.
//!
//! Aggregates per-port health, tunnel health and per-worker connection
//! counters. A single mutex guards everything; every mutation is O(1) and
//! readers copy out a snapshot, so the lock is never held across an await.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identifier of a listener worker, unique across all ports.
pub type WorkerId = usize;

/// Reachability verdict from the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Up => "up",
            HealthState::Down => "down",
        }
    }
}

/// Last probe result for one endpoint (a backend port or the tunnel).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
    /// Verdict of the last probe.
    pub status: HealthState,
    /// Connect latency; `None` when the probe failed.
    pub latency_ms: Option<f64>,
    /// When the last probe finished.
    pub last_checked: DateTime<Utc>,
}

pub type PortHealth = EndpointHealth;
pub type TunnelHealth = EndpointHealth;

/// Per-worker connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounters {
    /// Port the worker accepts on.
    pub listen_port: u16,
    /// Sessions currently relaying.
    pub active_connections: u64,
    /// Sessions that reached their backend since startup.
    pub total_connections: u64,
}

/// Point-in-time copy of the store.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Last probe result per listen port.
    pub ports: BTreeMap<u16, PortHealth>,
    /// Last tunnel probe result, `None` before the first cycle.
    pub tunnel: Option<TunnelHealth>,
    /// Counters per worker.
    pub workers: BTreeMap<WorkerId, WorkerCounters>,
    /// Seconds since the store was created.
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
struct StatusInner {
    ports: BTreeMap<u16, PortHealth>,
    tunnel: Option<TunnelHealth>,
    workers: BTreeMap<WorkerId, WorkerCounters>,
}

/// Mutex-guarded aggregate shared by workers, prober and status server.
#[derive(Debug)]
pub struct StatusStore {
    inner: Mutex<StatusInner>,
    started_at: Instant,
}

impl StatusStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner::default()),
            started_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        // Counters stay usable even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Create the counter entry for a worker.
    pub fn register_worker(&self, worker_id: WorkerId, listen_port: u16) {
        let mut inner = self.lock();
        inner.workers.insert(
            worker_id,
            WorkerCounters {
                listen_port,
                ..Default::default()
            },
        );
    }

    /// A session on `worker_id` reached its backend.
    pub fn connection_opened(&self, worker_id: WorkerId) {
        let mut inner = self.lock();
        let counters = inner.workers.entry(worker_id).or_default();
        counters.active_connections += 1;
        counters.total_connections += 1;
    }

    /// Count a session as opened; it is counted closed when the guard drops.
    pub fn track_connection(self: &Arc<Self>, worker_id: WorkerId) -> ActiveConnection {
        self.connection_opened(worker_id);
        ActiveConnection {
            store: Arc::clone(self),
            worker_id,
        }
    }

    /// A session on `worker_id` finished both directions.
    pub fn connection_closed(&self, worker_id: WorkerId) {
        let mut inner = self.lock();
        if let Some(counters) = inner.workers.get_mut(&worker_id) {
            counters.active_connections = counters.active_connections.saturating_sub(1);
        }
    }

    pub fn worker(&self, worker_id: WorkerId) -> Option<WorkerCounters> {
        self.lock().workers.get(&worker_id).cloned()
    }

    /// Store a probe result, returning the previous status for the port.
    pub fn record_port_health(&self, port: u16, health: PortHealth) -> Option<HealthState> {
        let mut inner = self.lock();
        inner
            .ports
            .insert(port, health)
            .map(|previous| previous.status)
    }

    pub fn port_health(&self, port: u16) -> Option<PortHealth> {
        self.lock().ports.get(&port).cloned()
    }

    pub fn record_tunnel_health(&self, health: TunnelHealth) {
        self.lock().tunnel = Some(health);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            ports: inner.ports.clone(),
            tunnel: inner.tunnel.clone(),
            workers: inner.workers.clone(),
            uptime_seconds: self.uptime().as_secs(),
        }
    }
}

/// Holds one `active_connections` slot for a worker until dropped.
#[derive(Debug)]
pub struct ActiveConnection {
    store: Arc<StatusStore>,
    worker_id: WorkerId,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.store.connection_closed(self.worker_id);
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
