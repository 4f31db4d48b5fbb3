use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::{
    breaker::{BreakerConfig, CircuitBreaker},
    Event,
};

/// A downstream target for enriched events.
#[async_trait]
pub trait Exporter: Send + Sync + 'static {
    // Returns the unique id of the exporter.
    fn id(&self) -> &str;
    // Persist or forward one event.
    async fn export(&self, event: &Event) -> Result<(), ExportError>;
    // Flush buffered events, called on shutdown.
    async fn flush(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

#[async_trait]
impl Exporter for Box<dyn Exporter> {
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn export(&self, event: &Event) -> Result<(), ExportError> {
        (**self).export(event).await
    }

    async fn flush(&self) -> Result<(), ExportError> {
        (**self).flush().await
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error, {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize/deserialize error, {0}")]
    Serde(#[from] serde_json::Error),
    #[error("downstream unavailable, {0}")]
    Unavailable(String),
    #[error("export timed out after {0:?}")]
    Timeout(Duration),
    #[error("event refused, {0}")]
    Refused(String),
}

impl ExportError {
    /// Serialization failures and refused events are the event's fault,
    /// retrying won't help and they say nothing about the downstream health.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExportError::Serde(_) | ExportError::Refused(_))
    }
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("circuit of exporter {exporter} is open")]
    CircuitOpen { exporter: String },
    #[error("exporter {exporter} rejected the event, {source}")]
    Rejected {
        exporter: String,
        #[source]
        source: ExportError,
    },
    #[error("exporter {exporter} failed after {attempts} attempts, {source}")]
    Exhausted {
        exporter: String,
        attempts: usize,
        #[source]
        source: ExportError,
    },
}

/// Retry policy of the output.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single attempt timeout (unit: milliseconds, 0 disables it)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_timeout_ms() -> u64 {
    1_000
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1_000
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based), doubling each time.
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 1u64.checked_shl(retry as u32).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub retry: BackoffPolicy,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
}

/// An exporter guarded by retries and a circuit breaker.
#[derive(Clone)]
pub struct Output {
    exporter: Arc<dyn Exporter>,
    retry: BackoffPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Output {
    pub fn new(exporter: impl Exporter, config: OutputConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            exporter.id().to_string(),
            config.circuit_breaker,
        ));
        Self {
            exporter: Arc::new(exporter),
            retry: config.retry,
            breaker,
        }
    }

    pub fn id(&self) -> &str {
        self.exporter.id()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Hands an event to the exporter.
    ///
    /// Refuses at once while the circuit is open. Retryable failures are
    /// retried with exponential backoff and counted by the breaker, which may
    /// open in between and end the retries early.
    pub async fn emit(&self, event: &Event) -> Result<(), EmitError> {
        let exporter = self.exporter.id();
        let mut attempts = 0;
        loop {
            if !self.breaker.allow_request() {
                return Err(EmitError::CircuitOpen {
                    exporter: exporter.to_string(),
                });
            }
            attempts += 1;
            let result = match self.retry.attempt_timeout() {
                Some(limit) => timeout(limit, self.exporter.export(event))
                    .await
                    .unwrap_or(Err(ExportError::Timeout(limit))),
                None => self.exporter.export(event).await,
            };
            match result {
                Ok(()) => {
                    self.breaker.record_success();
                    debug!("event {} is exported by {exporter}", event.id());
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    self.breaker.release_trial();
                    return Err(EmitError::Rejected {
                        exporter: exporter.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if attempts > self.retry.max_retries {
                        return Err(EmitError::Exhausted {
                            exporter: exporter.to_string(),
                            attempts,
                            source: e,
                        });
                    }
                    let delay = self.retry.delay(attempts - 1);
                    warn!(
                        "exporting event {} to {exporter} failed, {e}, retrying in {delay:?}",
                        event.id()
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    pub async fn flush(&self) -> Result<(), ExportError> {
        self.exporter.flush().await
    }
}
