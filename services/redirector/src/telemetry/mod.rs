//! Telemetry to the management API.
//!
//! Eight event streams (connections, errors, warnings, successes and
//! health) are POSTed as JSON with bearer auth. Callers hand events to an
//! [`EventSink`]; the HTTP implementation delivers them from detached tasks
//! with bounded retries and a cap on in-flight events.

mod client;
mod events;

pub use client::{EventSink, TelemetryClient, TelemetrySettings};
pub use events::{
    PortHealthReport, Severity, SucceededAccess, TelemetryEvent, TunnelConnection, TunnelError,
    TunnelHealthReport, Warning, WebConnection, WebError, STREAMS,
};
