//! L4 TCP redirection.
//!
//! This module provides:
//! - Listener workers sharing a port via SO_REUSEPORT
//! - Per-connection session handling with backend dial
//! - Bidirectional byte forwarding with idle timeouts
//!
//! ## Architecture
//!
//! ```text
//! Client -> ListenerWorker -> ConnectionHandler -> Backend
//!                                   |
//!                     relay (two joined copy loops)
//!                                   |
//!                      lifecycle telemetry + counters
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let config = HandlerConfig::default();
//! let handler = Arc::new(ConnectionHandler::new(route, 0, config, store, sink.clone()));
//! let worker = ListenerWorker::bind("0.0.0.0:8080".parse()?, 65535, handler, sink)?;
//! worker.run(shutdown_rx, Duration::from_secs(10)).await;
//! ```

mod forward;
mod handler;
mod worker;

pub use forward::{relay, DirectionEnd, DirectionResult, RelayResult};
pub use handler::{ConnectionHandler, HandlerConfig, Session, SessionOutcome};
pub use worker::{bind_shared, ListenerWorker, DEFAULT_BACKLOG};

pub(crate) use handler::millis_f64;
