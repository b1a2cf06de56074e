//! Management API client for telemetry.
//!
//! Delivery is best effort: every push is retried a fixed number of times
//! with a fixed delay and then dropped. Nothing here ever reports failure
//! to the forwarding path; `dispatch` returns before any I/O happens.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use super::events::TelemetryEvent;
use crate::config::Config;

/// Destination for telemetry events.
///
/// Implementations must not block: `dispatch` is called from session and
/// prober tasks and has to return immediately.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: TelemetryEvent);
}

/// Telemetry client settings.
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub max_in_flight: usize,
}

impl TelemetrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.api_url.clone(),
            token: config.api_token.clone(),
            timeout: config.telemetry_timeout,
            retries: config.telemetry_retries,
            retry_delay: config.telemetry_retry_delay,
            max_in_flight: config.telemetry_max_in_flight,
        }
    }
}

/// HTTP telemetry client.
///
/// Cheap to clone; clones share the connection pool and the in-flight cap.
#[derive(Clone)]
pub struct TelemetryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    settings: TelemetrySettings,
    in_flight: Arc<Semaphore>,
}

impl TelemetryClient {
    /// Create a new telemetry client.
    pub fn new(settings: TelemetrySettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("Failed to build telemetry HTTP client")?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                in_flight: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
                settings,
            }),
        })
    }

    /// POST `payload` as JSON to `base_url + endpoint`.
    ///
    /// Makes at most `retries + 1` attempts. Only a 200 response counts as
    /// delivered; anything else (status, timeout, transport error) is retried
    /// after `retry_delay`. Returns whether the event was delivered.
    pub async fn push<T>(&self, endpoint: &str, payload: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        let settings = &self.inner.settings;
        let url = format!("{}{}", settings.base_url, endpoint);
        let attempts = settings.retries + 1;

        for attempt in 1..=attempts {
            let result = self
                .inner
                .http
                .post(&url)
                .bearer_auth(&settings.token)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status() == StatusCode::OK => {
                    trace!(url = %url, attempt, "Telemetry delivered");
                    return true;
                }
                Ok(response) => {
                    debug!(url = %url, attempt, status = %response.status(), "Telemetry rejected");
                }
                Err(e) => {
                    debug!(url = %url, attempt, error = %e, "Telemetry request failed");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(settings.retry_delay).await;
            }
        }

        debug!(url = %url, attempts, "Telemetry dropped after retries");
        false
    }

    /// Deliver one event, awaiting the outcome.
    pub async fn send(&self, event: &TelemetryEvent) -> bool {
        self.push(&event.endpoint(), event).await
    }

    /// Events currently being delivered.
    pub fn in_flight(&self) -> usize {
        self.inner.settings.max_in_flight.max(1) - self.inner.in_flight.available_permits()
    }
}

impl EventSink for TelemetryClient {
    fn dispatch(&self, event: TelemetryEvent) {
        let permit = match Arc::clone(&self.inner.in_flight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(stream = event.stream(), "Telemetry backlog full, event dropped");
                return;
            }
        };

        let client = self.clone();
        tokio::spawn(async move {
            client.send(&event).await;
            drop(permit);
        });
    }
}
