use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    codec::{decode_batch, decode_event, ParseError, ParseLimits},
    pipeline::{Overloaded, PipelineHandle},
    Event,
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed event, {0}")]
    Parse(#[from] ParseError),
    #[error("overloaded, {0}")]
    Overloaded(#[from] Overloaded),
}

impl IngestError {
    pub fn is_overload(&self) -> bool {
        matches!(self, IngestError::Overloaded(_))
    }
}

/// What the caller learns about an admitted event. The event itself is owned
/// by the pipeline from here on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of a batch submission. Events are admitted in order until the
/// first overload, the rest of the batch is not enqueued.
#[derive(Debug)]
pub struct BatchReceipt {
    pub accepted: Vec<Receipt>,
    pub overloaded: Option<Overloaded>,
    pub total: usize,
}

/// Front end shared by every collector: decode raw bytes, hand the event to
/// the pipeline. Holds no state of its own, clone it freely.
#[derive(Clone)]
pub struct Ingestor {
    pipeline: PipelineHandle,
    limits: ParseLimits,
}

impl Ingestor {
    pub fn new(pipeline: PipelineHandle, limits: ParseLimits) -> Self {
        Self { pipeline, limits }
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    pub fn parse(&self, raw: &[u8]) -> Result<Event, ParseError> {
        decode_event(raw, &self.limits)
    }

    /// Decodes one event and enqueues it. A malformed event is rejected
    /// without touching the queue.
    #[instrument(skip_all, fields(bytes = raw.len()))]
    pub async fn submit(&self, raw: &[u8]) -> Result<Receipt, IngestError> {
        let event = self.parse(raw).map_err(|e| {
            self.pipeline.record_parse_rejection();
            debug!("rejected malformed event, {e}");
            e
        })?;
        self.admit(event).await
    }

    /// Enqueues an already decoded event.
    pub async fn admit(&self, event: Event) -> Result<Receipt, IngestError> {
        let stream = event.meta.stream.clone();
        let timestamp = event.timestamp;
        let id = self.pipeline.enqueue(event).await?;
        Ok(Receipt {
            id,
            stream,
            timestamp,
        })
    }

    /// Decodes a single event or a JSON array of events. Decoding is
    /// all-or-nothing, admission stops at the first overload.
    #[instrument(skip_all, fields(bytes = raw.len()))]
    pub async fn submit_batch(&self, raw: &[u8]) -> Result<BatchReceipt, ParseError> {
        let events = decode_batch(raw, &self.limits).map_err(|e| {
            self.pipeline.record_parse_rejection();
            e
        })?;
        let total = events.len();
        let mut accepted = Vec::with_capacity(total);
        for event in events {
            match self.admit(event).await {
                Ok(receipt) => accepted.push(receipt),
                Err(IngestError::Overloaded(e)) => {
                    return Ok(BatchReceipt {
                        accepted,
                        overloaded: Some(e),
                        total,
                    })
                }
                Err(IngestError::Parse(e)) => return Err(e),
            }
        }
        Ok(BatchReceipt {
            accepted,
            overloaded: None,
            total,
        })
    }
}
