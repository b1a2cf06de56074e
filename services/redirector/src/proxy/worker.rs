//! Listener workers.
//!
//! Each worker owns its own listening socket bound with SO_REUSEADDR and
//! SO_REUSEPORT, so any number of workers can share one port and the kernel
//! spreads incoming connections across them. The accept loop never waits on
//! a session; every accepted connection runs in its own task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use super::handler::ConnectionHandler;
use crate::status::WorkerId;
use crate::telemetry::{EventSink, TelemetryEvent};

/// Default accept backlog.
pub const DEFAULT_BACKLOG: u32 = 65535;

/// Pause after a failed accept so persistent errors don't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind a listening TCP socket that other workers may bind too.
pub fn bind_shared(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// One accept loop for one (port, backend) pair.
pub struct ListenerWorker {
    worker_id: WorkerId,
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    sink: Arc<dyn EventSink>,
}

impl ListenerWorker {
    /// Bind `addr` and prepare a worker around `handler`.
    pub fn bind(
        addr: SocketAddr,
        backlog: u32,
        handler: Arc<ConnectionHandler>,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let listener = bind_shared(addr, backlog)?;
        debug!(
            bind_addr = %addr,
            worker_id = handler.worker_id(),
            backlog,
            "Worker socket bound"
        );

        Ok(Self {
            worker_id: handler.worker_id(),
            listener,
            handler,
            sink,
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` flips to true.
    ///
    /// On shutdown the listening socket is closed first; in-flight sessions
    /// then get `grace` to finish before they are aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        let Self {
            worker_id,
            listener,
            handler,
            sink,
        } = self;
        let port = handler.route().listen_port;

        info!(
            worker_id,
            port,
            backend = %handler.route().backend_target(),
            "Worker started"
        );

        let mut sessions = JoinSet::new();
        let mut stopping = *shutdown.borrow_and_update();

        while !stopping {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let handler = Arc::clone(&handler);
                        sessions.spawn(
                            async move {
                                handler.handle(stream, peer_addr).await;
                            }
                            .instrument(tracing::info_span!(
                                "session",
                                port,
                                worker_id,
                                peer = %peer_addr
                            )),
                        );
                    }
                    Err(e) => {
                        error!(worker_id, port, error = %e, "Accept error");
                        sink.dispatch(TelemetryEvent::web_error(
                            port,
                            "accept_error",
                            "0.0.0.0",
                            e.to_string(),
                        ));
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                changed = shutdown.changed() => {
                    stopping = changed.is_err() || *shutdown.borrow();
                }
            }
        }

        drop(listener);
        info!(worker_id, port, in_flight = sessions.len(), "Worker stopped accepting");

        if sessions.is_empty() {
            return;
        }

        let drained = timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                worker_id,
                port,
                remaining = sessions.len(),
                "Grace period elapsed, aborting sessions"
            );
            sessions.shutdown().await;
        }
    }
}
