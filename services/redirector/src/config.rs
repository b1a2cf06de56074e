//! Redirector configuration.
//!
//! Everything is env-driven and immutable for the lifetime of the process.
//! `Config::from_lookup` takes the variable source as a closure so the
//! parsing rules can be tested without touching the process environment.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Static mapping of one listen port to one backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRoute {
    pub listen_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
}

impl PortRoute {
    pub fn new(listen_port: u16, backend_host: impl Into<String>, backend_port: u16) -> Self {
        Self {
            listen_port,
            backend_host: backend_host.into(),
            backend_port,
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn backend_target(&self) -> String {
        join_host_port(&self.backend_host, self.backend_port)
    }
}

impl fmt::Display for PortRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.listen_port, self.backend_target())
    }
}

/// A `host:port` pair that is not resolved until it is dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn target(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .with_context(|| format!("expected host:port, got {s:?}"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            bail!("empty host in {s:?}");
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in {s:?}"))?;
        Ok(Self::new(host, port))
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Parse `8080=10.0.0.2:80,8443=10.0.0.2:443` into routes.
pub fn parse_routes(raw: &str) -> Result<Vec<PortRoute>> {
    let mut routes: Vec<PortRoute> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (listen, backend) = entry
            .split_once('=')
            .with_context(|| format!("route {entry:?} must look like listen_port=host:port"))?;
        let listen_port = listen
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid listen port in route {entry:?}"))?;
        if listen_port == 0 {
            bail!("listen port 0 is not allowed (route {entry:?})");
        }
        let backend: Endpoint = backend
            .parse()
            .with_context(|| format!("invalid backend in route {entry:?}"))?;

        if routes.iter().any(|r| r.listen_port == listen_port) {
            bail!("listen port {listen_port} is mapped more than once");
        }
        routes.push(PortRoute::new(listen_port, backend.host, backend.port));
    }

    if routes.is_empty() {
        bail!("no routes configured");
    }
    Ok(routes)
}

/// Redirector configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Static port -> backend mapping.
    pub routes: Vec<PortRoute>,

    /// Host the listeners bind on.
    pub listen_host: String,

    /// Listener workers per configured port.
    pub workers_per_port: usize,

    /// Accept backlog per listening socket.
    pub backlog: u32,

    /// Forwarding buffer size per direction.
    pub buffer_size: usize,

    /// Backend dial timeout.
    pub dial_timeout: Duration,

    /// Per-read idle timeout for each forwarding direction.
    pub idle_timeout: Duration,

    /// Dial latency above which a `high_latency` warning is sent.
    pub high_latency_threshold: Duration,

    /// Tunnel endpoint probed alongside the backends.
    pub tunnel: Endpoint,

    /// Management API base URL (example: http://localhost:8000).
    pub api_url: String,

    /// Bearer token for the management API.
    pub api_token: String,

    /// Per-attempt telemetry request timeout.
    pub telemetry_timeout: Duration,

    /// Retries after the first failed telemetry attempt.
    pub telemetry_retries: u32,

    /// Fixed delay between telemetry attempts.
    pub telemetry_retry_delay: Duration,

    /// Cap on concurrently in-flight telemetry events.
    pub telemetry_max_in_flight: usize,

    /// Health probe cycle interval.
    pub probe_interval: Duration,

    /// Timeout of a single health probe.
    pub probe_timeout: Duration,

    /// Local status server bind address.
    pub status_addr: SocketAddr,

    /// Target soft limit for open file descriptors.
    pub fd_limit: u64,

    /// Grace period for units to stop on shutdown.
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_routes = lookup("REDIRECTOR_ROUTES")
            .context("Missing routes. Set REDIRECTOR_ROUTES (example: 8080=10.0.0.2:80).")?;
        let routes = parse_routes(&raw_routes).context("REDIRECTOR_ROUTES is invalid.")?;

        let listen_host = lookup("REDIRECTOR_LISTEN_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers_per_port: usize =
            parse_var(&lookup, "REDIRECTOR_WORKERS_PER_PORT", default_workers)?.max(1);

        let backlog: u32 = parse_var(&lookup, "REDIRECTOR_BACKLOG", 65535u32)?.max(1);
        let buffer_size: usize =
            parse_var(&lookup, "REDIRECTOR_BUFFER_SIZE", 64 * 1024usize)?.max(1024);

        let dial_timeout = Duration::from_millis(
            parse_var(&lookup, "REDIRECTOR_DIAL_TIMEOUT_MS", 2000u64)?.max(1),
        );
        let idle_timeout = Duration::from_secs(
            parse_var(&lookup, "REDIRECTOR_IDLE_TIMEOUT_SECS", 300u64)?.max(1),
        );
        let high_latency_threshold =
            Duration::from_millis(parse_var(&lookup, "REDIRECTOR_HIGH_LATENCY_MS", 1000u64)?);

        let tunnel = match lookup("REDIRECTOR_TUNNEL_ADDR") {
            Some(raw) => raw
                .parse::<Endpoint>()
                .context("REDIRECTOR_TUNNEL_ADDR must be host:port.")?,
            None => Endpoint::new(routes[0].backend_host.clone(), routes[0].backend_port),
        };

        let api_url = lookup("REDIRECTOR_API_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string())
            .trim_end_matches('/')
            .to_string();
        let api_token = lookup("REDIRECTOR_API_TOKEN").unwrap_or_default();

        let telemetry_timeout = Duration::from_millis(
            parse_var(&lookup, "REDIRECTOR_TELEMETRY_TIMEOUT_MS", 2000u64)?.max(1),
        );
        let telemetry_retries: u32 = parse_var(&lookup, "REDIRECTOR_TELEMETRY_RETRIES", 3u32)?;
        let telemetry_retry_delay = Duration::from_millis(parse_var(
            &lookup,
            "REDIRECTOR_TELEMETRY_RETRY_DELAY_MS",
            100u64,
        )?);
        let telemetry_max_in_flight: usize =
            parse_var(&lookup, "REDIRECTOR_TELEMETRY_MAX_IN_FLIGHT", 1024usize)?.max(1);

        let probe_interval =
            Duration::from_secs(parse_var(&lookup, "REDIRECTOR_PROBE_INTERVAL_SECS", 5u64)?.max(1));
        // A probe may never eat more than half of the cycle.
        let probe_timeout = Duration::from_millis(
            parse_var(&lookup, "REDIRECTOR_PROBE_TIMEOUT_MS", 1000u64)?.max(1),
        )
        .min(probe_interval / 2);

        let status_addr: SocketAddr = parse_var(
            &lookup,
            "REDIRECTOR_STATUS_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 9090)),
        )?;

        let fd_limit: u64 = parse_var(&lookup, "REDIRECTOR_FD_LIMIT", 1_000_000u64)?;
        let shutdown_grace =
            Duration::from_secs(parse_var(&lookup, "REDIRECTOR_SHUTDOWN_GRACE_SECS", 10u64)?);

        let log_level = lookup("REDIRECTOR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            routes,
            listen_host,
            workers_per_port,
            backlog,
            buffer_size,
            dial_timeout,
            idle_timeout,
            high_latency_threshold,
            tunnel,
            api_url,
            api_token,
            telemetry_timeout,
            telemetry_retries,
            telemetry_retry_delay,
            telemetry_max_in_flight,
            probe_interval,
            probe_timeout,
            status_addr,
            fd_limit,
            shutdown_grace,
            log_level,
        })
    }

    /// Listen ports in configuration order.
    pub fn ports(&self) -> Vec<u16> {
        self.routes.iter().map(|r| r.listen_port).collect()
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} has an invalid value."))
        .map(|v| v.unwrap_or(default))
}
