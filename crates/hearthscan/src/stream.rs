//! The duplex progress stream: one channel per job carrying a tagged
//! event union inbound, and the outbound request vocabulary sent through
//! the transport seam.
//!
//! Ordering contract: for a given batch number, `batch_info` precedes all
//! of its `entity_result` events, which precede the next batch's
//! `batch_info` — submission is strictly sequential. `scan_progress` pings
//! may interleave freely and carry no ordering guarantee relative to batch
//! boundaries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::accounting::TokenStats;
use crate::correlation::Correlation;
use crate::error::TransportError;
use crate::store::{EntityCategory, EntityRecord};

/// Scan mode requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Classify everything; the result store is cleared first.
    Full,
    /// Classify only entities the backend has not seen in `existing_ids`;
    /// prior results are preserved.
    Incremental,
}

/// Every message a job's stream can carry, scan and correlation alike.
///
/// The coordinator and the analyzer each match exhaustively and skip the
/// other family's variants as malformed for their job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    EntityResult {
        entity: EntityRecord,
    },
    ScanProgress {
        message: String,
        batch_number: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compact_mode: Option<bool>,
    },
    BatchInfo {
        batch_number: u64,
        batch_size: u64,
        entities_in_batch: u64,
        remaining_entities: u64,
        retry_attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_entities: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processed_entities: Option<u64>,
    },
    BatchSizeReduced {
        old_size: u64,
        new_size: u64,
        retry_attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    BatchCompactMode {
        reason: String,
    },
    TokenLimitExceeded {
        batch: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compact_mode: Option<bool>,
    },
    ScanComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_stats: Option<TokenStats>,
    },
    CorrelationProgress {
        current: u64,
        total: u64,
        message: String,
    },
    CorrelationResult {
        entity_id: String,
        correlations: Vec<Correlation>,
    },
    CorrelationComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CorrelationError {},
}

/// One inbound message, tagged with the job generation it belongs to.
/// Events whose generation is not the current one are discarded by the
/// consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub generation: u64,
    pub event: StreamEvent,
}

/// Seed entity handed to a correlation job, captured from the result
/// store at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSeed {
    pub entity_id: String,
    pub weight: u8,
    pub reason: String,
    pub category: EntityCategory,
}

impl CorrelationSeed {
    pub fn from_record(record: &EntityRecord, effective_weight: u8) -> Self {
        Self {
            entity_id: record.entity_id.clone(),
            weight: effective_weight,
            reason: record.overall_reason.clone(),
            category: record
                .categories
                .iter()
                .next()
                .copied()
                .unwrap_or(EntityCategory::Data),
        }
    }
}

/// Requests sent to the classification backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundRequest {
    StartScan {
        mode: ScanMode,
        language: String,
        existing_ids: Vec<String>,
        batch_size: usize,
    },
    StartCorrelation {
        entities: Vec<CorrelationSeed>,
        language: String,
    },
    Stop {},
}

/// Emitting side of a job's stream, handed to the backend integration on
/// submission. Every emitted event carries the job generation.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl StreamHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Emits an event; returns false when the consumer is gone.
    pub fn emit(&self, event: StreamEvent) -> bool {
        self.tx
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Consuming side of a job's stream, opened once per job and conceptually
/// closed on `scan_complete`, terminal error, or cancellation.
#[derive(Debug)]
pub struct ProgressStream {
    generation: u64,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ProgressStream {
    /// Opens a fresh stream for the given job generation.
    pub fn open(generation: u64) -> (StreamHandle, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StreamHandle { generation, tx },
            ProgressStream { generation, rx },
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl futures_util::Stream for ProgressStream {
    type Item = Envelope;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Envelope>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// The backend integration: carries requests out-of-band and feeds events
/// back through the [`StreamHandle`] it receives with each submission.
#[async_trait]
pub trait ScanTransport: Send + Sync {
    /// Submits a job request along with the emitting end of its stream.
    async fn submit(
        &self,
        request: OutboundRequest,
        events: StreamHandle,
    ) -> Result<(), TransportError>;

    /// Signals cancellation out-of-band, independent of any open stream.
    async fn stop(&self) -> Result<(), TransportError>;
}

/// Transport doubles for tests and for embedding without a live backend.
pub mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{OutboundRequest, ScanTransport, StreamHandle};
    use crate::error::TransportError;

    /// Accepts every request and drops the stream handle.
    #[derive(Debug, Default)]
    pub struct NullTransport;

    #[async_trait]
    impl ScanTransport for NullTransport {
        async fn submit(
            &self,
            _request: OutboundRequest,
            _events: StreamHandle,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Records submitted requests and stop signals; optionally fails.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        pub requests: Mutex<Vec<OutboundRequest>>,
        pub stops: Mutex<u32>,
        pub fail_submit: bool,
    }

    impl RecordingTransport {
        pub fn failing() -> Self {
            Self {
                fail_submit: true,
                ..Self::default()
            }
        }

        pub fn requests(&self) -> Vec<OutboundRequest> {
            self.requests.lock().expect("requests lock").clone()
        }

        pub fn stop_count(&self) -> u32 {
            *self.stops.lock().expect("stops lock")
        }
    }

    #[async_trait]
    impl ScanTransport for RecordingTransport {
        async fn submit(
            &self,
            request: OutboundRequest,
            _events: StreamHandle,
        ) -> Result<(), TransportError> {
            if self.fail_submit {
                return Err(TransportError::Unreachable("recording transport".into()));
            }
            self.requests.lock().expect("requests lock").push(request);
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            *self.stops.lock().expect("stops lock") += 1;
            Ok(())
        }
    }
}
