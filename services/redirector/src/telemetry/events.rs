//! Telemetry event schemas.
//!
//! One struct per stream; `TelemetryEvent` ties each to its endpoint.
//! Bodies are serialized flat (no enum tag) because the endpoint already
//! identifies the kind.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::status::{HealthState, WorkerId};

/// Stream names reported by `/status`, in endpoint order.
pub const STREAMS: [&str; 8] = [
    "web",
    "l2n",
    "errors_web",
    "errors_l2n",
    "warnings",
    "succeeded",
    "health",
    "health_l2n",
];

/// Warning severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Degraded but serving (slow backend dial).
    Medium,
    /// A backend stopped accepting connections.
    High,
}

/// `/api/v1/web/{port}`: client side of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebConnection {
    /// When the session closed.
    pub timestamp: DateTime<Utc>,
    /// Listen port the client connected to.
    pub port: u16,
    /// Client address.
    pub client_ip: String,
    pub client_port: u16,
    /// Bytes forwarded client to backend.
    pub bytes_in: u64,
    /// Bytes forwarded backend to client.
    pub bytes_out: u64,
    /// Session duration from accept to close.
    pub duration_ms: u64,
    /// Worker that owned the session.
    pub worker_id: WorkerId,
}

/// `/api/v1/l2n/{port}`: backend side of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelConnection {
    /// When the session closed.
    pub timestamp: DateTime<Utc>,
    /// Listen port the session came in on.
    pub port: u16,
    /// Backend address as dialed.
    pub backend_ip: String,
    pub backend_port: u16,
    /// Bytes forwarded client to backend.
    pub bytes_in: u64,
    /// Bytes forwarded backend to client.
    pub bytes_out: u64,
    /// Session duration from accept to close.
    pub duration_ms: u64,
    /// Backend dial latency.
    pub latency_ms: f64,
    /// Worker that owned the session.
    pub worker_id: WorkerId,
}

/// `/api/v1/errors/web/{port}`: failure on the client side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebError {
    /// Listen port; carried in the path, not the body.
    #[serde(skip)]
    pub port: u16,
    /// When the error happened.
    pub timestamp: DateTime<Utc>,
    /// Reason code (e.g. `accept_error`).
    pub error_type: String,
    /// Client address, `0.0.0.0` when unknown.
    pub client_ip: String,
    /// Human-readable detail.
    pub error_message: String,
}

/// `/api/v1/errors/l2n/{port}`: failure reaching the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelError {
    /// Listen port; carried in the path, not the body.
    #[serde(skip)]
    pub port: u16,
    /// When the error happened.
    pub timestamp: DateTime<Utc>,
    /// Reason code (`connection_timeout`, `connection_refused`,
    /// `connection_error`).
    pub error_type: String,
    /// Backend host that was dialed.
    pub backend_ip: String,
    /// Human-readable detail.
    pub error_message: String,
}

/// `/api/v1/warnings`: degraded but not failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    /// When the condition was seen.
    pub timestamp: DateTime<Utc>,
    /// Listen port concerned.
    pub port: u16,
    /// Warning code (`high_latency`, `backend_down`).
    pub warning_type: String,
    /// Human-readable detail.
    pub message: String,
    /// How urgent the condition is.
    pub severity: Severity,
}

/// `/api/v1/succeeded`: one completed client to backend relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SucceededAccess {
    /// When the session closed.
    pub timestamp: DateTime<Utc>,
    /// Listen port the session came in on.
    pub port: u16,
    /// Client address.
    pub client_ip: String,
    pub client_port: u16,
    /// Backend address.
    pub backend_ip: String,
    pub backend_port: u16,
    /// Bytes forwarded in both directions together.
    pub bytes_transferred: u64,
    /// Session duration from accept to close.
    pub duration_ms: u64,
}

/// `/api/v1/health/{port}`: probe result for one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortHealthReport {
    /// When the probe finished.
    pub timestamp: DateTime<Utc>,
    /// Listen port whose backend was probed.
    pub port: u16,
    /// Backend address as probed.
    pub backend_ip: String,
    pub backend_port: u16,
    /// Probe verdict.
    pub status: HealthState,
    /// Connect latency; `null` when the probe failed.
    pub latency_ms: Option<f64>,
}

/// `/api/v1/health/l2n`: probe result for the tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelHealthReport {
    /// When the probe finished.
    pub timestamp: DateTime<Utc>,
    /// Tunnel address as probed.
    pub tunnel_ip: String,
    pub tunnel_port: u16,
    /// Probe verdict.
    pub status: HealthState,
    /// Connect latency; `null` when the probe failed.
    pub latency_ms: Option<f64>,
}

/// Any event the redirector reports to the management API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryEvent {
    WebConnection(WebConnection),
    TunnelConnection(TunnelConnection),
    WebError(WebError),
    TunnelError(TunnelError),
    Warning(Warning),
    SucceededAccess(SucceededAccess),
    PortHealth(PortHealthReport),
    TunnelHealth(TunnelHealthReport),
}

impl TelemetryEvent {
    /// Path relative to the management API base URL.
    pub fn endpoint(&self) -> String {
        match self {
            TelemetryEvent::WebConnection(e) => format!("/api/v1/web/{}", e.port),
            TelemetryEvent::TunnelConnection(e) => format!("/api/v1/l2n/{}", e.port),
            TelemetryEvent::WebError(e) => format!("/api/v1/errors/web/{}", e.port),
            TelemetryEvent::TunnelError(e) => format!("/api/v1/errors/l2n/{}", e.port),
            TelemetryEvent::Warning(_) => "/api/v1/warnings".to_string(),
            TelemetryEvent::SucceededAccess(_) => "/api/v1/succeeded".to_string(),
            TelemetryEvent::PortHealth(e) => format!("/api/v1/health/{}", e.port),
            TelemetryEvent::TunnelHealth(_) => "/api/v1/health/l2n".to_string(),
        }
    }

    /// Stream name, one of [`STREAMS`].
    pub fn stream(&self) -> &'static str {
        match self {
            TelemetryEvent::WebConnection(_) => STREAMS[0],
            TelemetryEvent::TunnelConnection(_) => STREAMS[1],
            TelemetryEvent::WebError(_) => STREAMS[2],
            TelemetryEvent::TunnelError(_) => STREAMS[3],
            TelemetryEvent::Warning(_) => STREAMS[4],
            TelemetryEvent::SucceededAccess(_) => STREAMS[5],
            TelemetryEvent::PortHealth(_) => STREAMS[6],
            TelemetryEvent::TunnelHealth(_) => STREAMS[7],
        }
    }

    pub fn web_connection(
        port: u16,
        client_ip: impl Into<String>,
        client_port: u16,
        bytes_in: u64,
        bytes_out: u64,
        duration_ms: u64,
        worker_id: WorkerId,
    ) -> Self {
        TelemetryEvent::WebConnection(WebConnection {
            timestamp: Utc::now(),
            port,
            client_ip: client_ip.into(),
            client_port,
            bytes_in,
            bytes_out,
            duration_ms,
            worker_id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tunnel_connection(
        port: u16,
        backend_ip: impl Into<String>,
        backend_port: u16,
        bytes_in: u64,
        bytes_out: u64,
        duration_ms: u64,
        latency_ms: f64,
        worker_id: WorkerId,
    ) -> Self {
        TelemetryEvent::TunnelConnection(TunnelConnection {
            timestamp: Utc::now(),
            port,
            backend_ip: backend_ip.into(),
            backend_port,
            bytes_in,
            bytes_out,
            duration_ms,
            latency_ms,
            worker_id,
        })
    }

    pub fn web_error(
        port: u16,
        error_type: impl Into<String>,
        client_ip: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TelemetryEvent::WebError(WebError {
            port,
            timestamp: Utc::now(),
            error_type: error_type.into(),
            client_ip: client_ip.into(),
            error_message: message.into(),
        })
    }

    pub fn tunnel_error(
        port: u16,
        error_type: impl Into<String>,
        backend_ip: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TelemetryEvent::TunnelError(TunnelError {
            port,
            timestamp: Utc::now(),
            error_type: error_type.into(),
            backend_ip: backend_ip.into(),
            error_message: message.into(),
        })
    }

    pub fn warning(
        port: u16,
        warning_type: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        TelemetryEvent::Warning(Warning {
            timestamp: Utc::now(),
            port,
            warning_type: warning_type.into(),
            message: message.into(),
            severity,
        })
    }

    pub fn succeeded_access(
        port: u16,
        client_ip: impl Into<String>,
        client_port: u16,
        backend_ip: impl Into<String>,
        backend_port: u16,
        bytes_transferred: u64,
        duration_ms: u64,
    ) -> Self {
        TelemetryEvent::SucceededAccess(SucceededAccess {
            timestamp: Utc::now(),
            port,
            client_ip: client_ip.into(),
            client_port,
            backend_ip: backend_ip.into(),
            backend_port,
            bytes_transferred,
            duration_ms,
        })
    }

    pub fn port_health(
        port: u16,
        backend_ip: impl Into<String>,
        backend_port: u16,
        status: HealthState,
        latency_ms: Option<f64>,
    ) -> Self {
        TelemetryEvent::PortHealth(PortHealthReport {
            timestamp: Utc::now(),
            port,
            backend_ip: backend_ip.into(),
            backend_port,
            status,
            latency_ms,
        })
    }

    pub fn tunnel_health(
        tunnel_ip: impl Into<String>,
        tunnel_port: u16,
        status: HealthState,
        latency_ms: Option<f64>,
    ) -> Self {
        TelemetryEvent::TunnelHealth(TunnelHealthReport {
            timestamp: Utc::now(),
            tunnel_ip: tunnel_ip.into(),
            tunnel_port,
            status,
            latency_ms,
        })
    }
}
