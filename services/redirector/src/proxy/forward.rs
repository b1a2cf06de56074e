//! Byte forwarding between client and backend.
//!
//! Each session runs two copy loops, one per direction, joined together.
//! A loop ends on EOF, on its own idle timeout, or on an I/O error; only an
//! I/O error forces the opposite loop to stop as well. When a loop ends it
//! shuts down the write side of its destination so the peer sees EOF.
//!
//! The loops only count bytes into local integers. Nothing is reported per
//! chunk.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

/// Why a direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// Source closed its write side.
    Eof,
    /// No data within the idle timeout.
    IdleTimeout,
    /// Read or write failed.
    Error,
    /// Stopped because the other direction failed.
    Aborted,
}

/// Result of one copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionResult {
    pub bytes: u64,
    pub end: DirectionEnd,
}

/// Result of both copy loops of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayResult {
    /// client -> backend.
    pub upstream: DirectionResult,
    /// backend -> client.
    pub downstream: DirectionResult,
}

/// Relay bytes between `client` and `backend` until both directions end.
pub async fn relay(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    buffer_size: usize,
    idle_timeout: Duration,
) -> RelayResult {
    let (client_read, client_write) = client.split();
    let (backend_read, backend_write) = backend.split();

    let (fault_tx, fault_rx) = watch::channel(false);

    let upstream = copy_direction(
        client_read,
        backend_write,
        buffer_size,
        idle_timeout,
        &fault_tx,
        fault_rx.clone(),
    );
    let downstream = copy_direction(
        backend_read,
        client_write,
        buffer_size,
        idle_timeout,
        &fault_tx,
        fault_rx,
    );

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    RelayResult {
        upstream,
        downstream,
    }
}

/// Copy from `reader` to `writer` until EOF, idle timeout, error or a fault
/// on the other direction.
pub async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    idle_timeout: Duration,
    fault_tx: &watch::Sender<bool>,
    mut fault_rx: watch::Receiver<bool>,
) -> DirectionResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    let end = loop {
        let read = tokio::select! {
            read = timeout(idle_timeout, reader.read(&mut buf)) => read,
            _ = faulted(&mut fault_rx) => break DirectionEnd::Aborted,
        };

        let n = match read {
            Ok(Ok(0)) => break DirectionEnd::Eof,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break DirectionEnd::Error,
            Err(_) => break DirectionEnd::IdleTimeout,
        };

        match timeout(idle_timeout, writer.write_all(&buf[..n])).await {
            Ok(Ok(())) => total += n as u64,
            Ok(Err(_)) => break DirectionEnd::Error,
            Err(_) => break DirectionEnd::IdleTimeout,
        }
    };

    if end == DirectionEnd::Error {
        fault_tx.send_replace(true);
    }

    // Best effort: the peer may already be gone.
    let _ = shutdown_write(&mut writer, idle_timeout).await;

    DirectionResult { bytes: total, end }
}

async fn shutdown_write<W>(writer: &mut W, limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(limit, writer.shutdown())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "shutdown timeout"))?
}

/// Resolves once the fault flag is set; never resolves if the sender is gone.
async fn faulted(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
