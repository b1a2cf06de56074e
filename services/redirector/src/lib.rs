//! plfm-vt Redirector
//!
//! L4 TCP redirector for tunnel ports. Accepts client connections on each
//! configured port, forwards bytes to a fixed backend, and reports
//! connection lifecycle and health telemetry to the control plane API.

pub mod config;
pub mod error;
pub mod prober;
pub mod proxy;
pub mod server;
pub mod status;
pub mod supervisor;
pub mod telemetry;

pub use config::{Config, Endpoint, PortRoute};
pub use error::DialError;
pub use proxy::{ConnectionHandler, HandlerConfig, ListenerWorker, Session, SessionOutcome};
pub use status::StatusStore;
pub use supervisor::Supervisor;
pub use telemetry::{EventSink, TelemetryClient, TelemetryEvent};
