//! Batching HTTP delivery of audit events.
//!
//! Events are buffered in memory and POSTed as a JSON array to
//! `{endpoint}/api/v1/events`, either when the buffer reaches the batch size
//! or when the background timer fires. Failed deliveries are retried with
//! exponential backoff; a batch that still fails is dropped and logged.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::sinks::{EventMap, Sink, SinkError};
use crate::error::{AaaError, Result};
use crate::hardening::validate_https_url;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const EVENTS_PATH: &str = "/api/v1/events";
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Batching sink configuration. Zero values take the defaults.
#[derive(Debug, Clone, Default)]
pub struct BatchingSinkConfig {
    /// Base URL of the ingestion service
    pub endpoint: String,
    /// Sent as `Authorization: Bearer <api_key>`
    pub api_key: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
}

impl BatchingSinkConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration and fill in defaults.
    pub fn validate(&mut self) -> Result<()> {
        validate_https_url(&self.endpoint, "batching_sink: endpoint")?;
        if self.api_key.is_empty() {
            return Err(AaaError::Config("batching_sink: api_key is required".to_string()));
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        Ok(())
    }

    fn events_url(&self) -> String {
        format!("{}{EVENTS_PATH}", self.endpoint.trim_end_matches('/'))
    }
}

/// Backoff before retry `attempt` (1-based): 100ms, 200ms, 400ms, ...
fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

struct Shared {
    config: BatchingSinkConfig,
    url: String,
    client: Client,
    buffer: Mutex<Vec<EventMap>>,
}

impl Shared {
    async fn flush(&self) -> std::result::Result<(), SinkError> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.send_with_retry(&batch).await
    }

    async fn send_with_retry(&self, batch: &[EventMap]) -> std::result::Result<(), SinkError> {
        let attempts = self.config.max_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }
            match self.send(batch).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "audit batch delivery attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.map(|e| e.to_string()).unwrap_or_default();
        tracing::error!(events = batch.len(), attempts, error = %last, "dropping audit batch");
        Err(SinkError::Delivery(format!(
            "all {attempts} attempts failed, last error: {last}"
        )))
    }

    async fn send(&self, batch: &[EventMap]) -> std::result::Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.config.api_key)
            .json(batch)
            .send()
            .await
            .map_err(|e| SinkError::Delivery(format!("http request: {e}")))?;

        if !response.status().is_success() {
            return Err(SinkError::Delivery(format!(
                "unexpected status {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Buffers events and ships them in batches from a background task.
pub struct BatchingHttpSink {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<std::result::Result<(), SinkError>>>>,
}

impl std::fmt::Debug for BatchingHttpSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingHttpSink")
            .field("url", &self.shared.url)
            .field("batch_size", &self.shared.config.batch_size)
            .finish_non_exhaustive()
    }
}

impl BatchingHttpSink {
    /// Validate `config` and start the background flush task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(mut config: BatchingSinkConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout).build()?;
        let shared = Arc::new(Shared {
            url: config.events_url(),
            buffer: Mutex::new(Vec::with_capacity(config.batch_size)),
            config,
            client,
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(flush_loop(shared.clone(), cancel.clone()));

        Ok(Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Number of events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.buffer.lock().len()
    }
}

async fn flush_loop(shared: Arc<Shared>, cancel: CancellationToken) -> std::result::Result<(), SinkError> {
    let mut ticker = tokio::time::interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("audit batch sink shutting down");
                return shared.flush().await;
            }
            _ = ticker.tick() => {
                // Failures are logged inside; the batch is already gone.
                let _ = shared.flush().await;
            }
        }
    }
}

#[async_trait]
impl Sink for BatchingHttpSink {
    async fn write(&self, event: EventMap) -> std::result::Result<(), SinkError> {
        if self.cancel.is_cancelled() {
            return Err(SinkError::Closed);
        }
        let full = {
            let mut buffer = self.shared.buffer.lock();
            buffer.push(event);
            buffer.len() >= self.shared.config.batch_size
        };
        if full {
            return self.shared.flush().await;
        }
        Ok(())
    }

    async fn flush(&self) -> std::result::Result<(), SinkError> {
        self.shared.flush().await
    }

    /// Stop the background task after it delivers whatever is still buffered.
    async fn close(&self) -> std::result::Result<(), SinkError> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| SinkError::Delivery(format!("flush task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for BatchingHttpSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
