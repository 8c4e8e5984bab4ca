//! Scan job lifecycle: owns the state machine, consumes the progress
//! stream, and updates the result store and token accountant.
//!
//! All state lives on an explicit coordinator object and is mutated only
//! through event handling; the presentation layer observes via
//! [`ScanCoordinator::snapshot`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::accounting::{TokenAccountant, TokenStats};
use crate::config::ScanConfig;
use crate::control::OperationController;
use crate::error::{HearthscanError, Result, TransportError};
use crate::persist::{ResultsEnvelope, RunSummary, StorageBackend};
use crate::store::{EntityRecord, OverrideRecord, ResultStore};
use crate::stream::{
    Envelope, OutboundRequest, ProgressStream, ScanMode, ScanTransport, StreamEvent,
};

/// Lifecycle state of the scan job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Idle,
    /// A batch has been submitted to the provider.
    Requesting,
    /// Awaiting or parsing the provider's reply.
    Processing,
    Complete,
    Error,
}

impl ScanStatus {
    fn is_running(&self) -> bool {
        matches!(self, ScanStatus::Requesting | ScanStatus::Processing)
    }
}

/// Fine-grained progress of the current (or last) scan run. Recreated at
/// job start and mutated per event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    pub status: ScanStatus,
    pub batch_number: u64,
    pub entities_in_batch: u64,
    pub remaining_entities: u64,
    /// Distinct entities classified this run.
    pub processed: u64,
    /// Unknown until the first `batch_info` (or an explicit total) arrives.
    pub total_entities: Option<u64>,
    /// Non-decreasing within a batch.
    pub retry_attempt: u32,
    pub compact_mode: bool,
}

/// Read-only view for the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub progress: ScanProgress,
    pub token_stats: TokenStats,
    pub entity_count: u64,
    pub last_scan_timestamp: Option<DateTime<Utc>>,
    pub last_summary: Option<RunSummary>,
}

/// Owns the scan job's lifecycle and all mutable scan state.
pub struct ScanCoordinator {
    config: ScanConfig,
    controller: Arc<OperationController>,
    transport: Arc<dyn ScanTransport>,
    storage: Arc<dyn StorageBackend>,
    store: ResultStore,
    accountant: TokenAccountant,
    progress: ScanProgress,
    /// Ids counted toward `processed` this run; makes the count idempotent
    /// under repeated `entity_result` events for the same id.
    seen: HashSet<String>,
    generation: u64,
    last_event_at: Option<Instant>,
    last_scan_timestamp: Option<DateTime<Utc>>,
    last_summary: Option<RunSummary>,
    last_limit: Option<(u64, String)>,
}

impl ScanCoordinator {
    pub fn new(
        config: ScanConfig,
        controller: Arc<OperationController>,
        transport: Arc<dyn ScanTransport>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            config,
            controller,
            transport,
            storage,
            store: ResultStore::new(),
            accountant: TokenAccountant::new(),
            progress: ScanProgress::default(),
            seen: HashSet::new(),
            generation: 0,
            last_event_at: None,
            last_scan_timestamp: None,
            last_summary: None,
            last_limit: None,
        }
    }

    /// Seeds state from previously persisted results and overrides.
    pub async fn hydrate(&mut self) -> Result<()> {
        if let Some(envelope) = self.storage.load_results().await? {
            self.last_scan_timestamp = envelope.last_scan_timestamp;
            self.store.load(envelope.results);
            info!("Loaded {} saved classification results", self.store.len());
        }
        let overrides = self.storage.load_overrides().await?;
        if !overrides.is_empty() {
            debug!("Loaded {} user overrides", overrides.len());
            self.store.load_overrides(overrides);
        }
        Ok(())
    }

    /// Starts a scan job.
    ///
    /// Rejected with a protocol error while a job is active. A full scan
    /// clears the store first; an incremental scan preserves existing rows
    /// and sends their ids so the backend only requests unclassified
    /// entities. `known_ids` overrides the id list sent for incremental
    /// mode; when empty, the store's current ids are used.
    pub async fn start(&mut self, mode: ScanMode, known_ids: Vec<String>) -> Result<ProgressStream> {
        if self.progress.status.is_running() {
            return Err(HearthscanError::Protocol(
                "a scan job is already active".to_string(),
            ));
        }
        let generation = self.controller.begin().ok_or_else(|| {
            HearthscanError::Protocol("another job is already active".to_string())
        })?;

        let existing_ids = match mode {
            ScanMode::Full => {
                self.store.clear();
                Vec::new()
            }
            ScanMode::Incremental => {
                if known_ids.is_empty() {
                    self.store.ids()
                } else {
                    known_ids
                }
            }
        };

        self.accountant.reset();
        self.progress = ScanProgress::default();
        self.seen.clear();
        self.last_limit = None;

        let (handle, stream) = ProgressStream::open(generation);
        let request = OutboundRequest::StartScan {
            mode,
            language: self.config.language.clone(),
            existing_ids,
            batch_size: self.config.batch_size,
        };
        if let Err(e) = self.transport.submit(request, handle).await {
            self.controller.finish(generation);
            return Err(e.into());
        }

        self.generation = generation;
        self.progress.status = ScanStatus::Requesting;
        self.last_event_at = Some(Instant::now());
        info!("Scan started (mode {mode:?}, generation {generation})");
        Ok(stream)
    }

    /// Consumes events until the job terminates, returning the run
    /// summary on completion.
    pub async fn run(&mut self, mut stream: ProgressStream) -> Result<RunSummary> {
        while let Some(envelope) = stream.recv().await {
            self.handle_envelope(envelope);
            match self.progress.status {
                ScanStatus::Complete => {
                    return self.last_summary.clone().ok_or_else(|| {
                        HearthscanError::Protocol("completed without a run summary".to_string())
                    });
                }
                ScanStatus::Error => {
                    let (batch, message) = self.last_limit.clone().unwrap_or_default();
                    return Err(HearthscanError::ProviderLimit { batch, message });
                }
                _ => {}
            }
        }
        // Channel closed without a terminal event: a transport failure,
        // distinct from the provider token limit. Partial results stay.
        self.controller.finish(self.generation);
        self.progress.status = ScanStatus::Error;
        Err(TransportError::ChannelClosed.into())
    }

    /// Applies one inbound event to the scan state.
    ///
    /// Events from a superseded generation, or arriving after a terminal
    /// state, are discarded. Malformed events are logged and skipped
    /// without aborting the stream.
    pub fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.generation != self.generation
            || !self.controller.is_current(envelope.generation)
        {
            debug!(
                "Discarding stale scan event (generation {} != {})",
                envelope.generation, self.generation
            );
            return;
        }
        if !self.progress.status.is_running() {
            debug!("Discarding scan event outside a running job");
            return;
        }
        self.last_event_at = Some(Instant::now());

        match envelope.event {
            StreamEvent::EntityResult { entity } => self.on_entity_result(entity),
            StreamEvent::ScanProgress {
                message,
                batch_number,
                prompt_size,
                response_size,
                compact_mode,
            } => {
                debug!("Scan progress (batch {batch_number}): {message}");
                self.progress.batch_number = batch_number;
                if let Some(chars) = prompt_size {
                    self.accountant.add_prompt_chars(chars);
                    self.progress.status = ScanStatus::Requesting;
                }
                if let Some(chars) = response_size {
                    self.accountant.add_response_chars(chars);
                    self.progress.status = ScanStatus::Processing;
                }
                if let Some(compact) = compact_mode {
                    self.progress.compact_mode = compact;
                }
            }
            StreamEvent::BatchInfo {
                batch_number,
                batch_size: _,
                entities_in_batch,
                remaining_entities,
                retry_attempt,
                total_entities,
                processed_entities,
            } => {
                let same_batch = batch_number == self.progress.batch_number;
                self.progress.batch_number = batch_number;
                self.progress.entities_in_batch = entities_in_batch;
                self.progress.remaining_entities = remaining_entities;
                self.progress.retry_attempt = if same_batch {
                    self.progress.retry_attempt.max(retry_attempt)
                } else {
                    retry_attempt
                };
                if let Some(total) = total_entities {
                    self.progress.total_entities = Some(total);
                } else if self.progress.total_entities.is_none() {
                    self.progress.total_entities =
                        Some(self.progress.processed + entities_in_batch + remaining_entities);
                }
                if let Some(processed) = processed_entities {
                    self.progress.processed = self.progress.processed.max(processed);
                }
                self.reconcile_total();
            }
            StreamEvent::BatchSizeReduced {
                old_size,
                new_size,
                retry_attempt,
                message,
            } => {
                self.progress.retry_attempt = self.progress.retry_attempt.max(retry_attempt);
                info!(
                    "Batch size reduced {old_size} -> {new_size} (attempt {retry_attempt}){}",
                    message.map(|m| format!(": {m}")).unwrap_or_default()
                );
            }
            StreamEvent::BatchCompactMode { reason } => {
                self.progress.compact_mode = true;
                info!("Compact mode enabled: {reason}");
            }
            StreamEvent::TokenLimitExceeded { batch, message, .. } => {
                warn!("Token limit reached at batch {batch}: {message}");
                self.last_limit = Some((batch, message));
                self.progress.status = ScanStatus::Error;
                self.controller.finish(self.generation);
            }
            StreamEvent::ScanComplete { token_stats } => self.on_scan_complete(token_stats),
            other => {
                warn!("Skipping correlation event on scan stream: {other:?}");
            }
        }
    }

    fn on_entity_result(&mut self, entity: EntityRecord) {
        let entity_id = entity.entity_id.clone();
        self.store.upsert(entity);
        if self.seen.insert(entity_id) {
            self.progress.processed += 1;
            self.reconcile_total();
        }
        self.persist_results();
    }

    /// Keeps `processed <= total_entities`. An inferred total can come up
    /// short when the backend delivers more results than the first batch
    /// advertised; the total is raised rather than the count capped.
    fn reconcile_total(&mut self) {
        if let Some(total) = self.progress.total_entities {
            if self.progress.processed > total {
                warn!(
                    "Processed count {} exceeded the known total {total}; raising total",
                    self.progress.processed
                );
                self.progress.total_entities = Some(self.progress.processed);
            }
        }
    }

    fn on_scan_complete(&mut self, token_stats: Option<TokenStats>) {
        if let Some(stats) = token_stats {
            self.accountant.apply_authoritative(stats);
        }
        let stats = self
            .accountant
            .stats(self.progress.processed, self.config.cost_per_token);
        let summary = RunSummary::new(self.store.len() as u64, stats);
        self.last_scan_timestamp = Some(summary.timestamp);
        self.last_summary = Some(summary.clone());
        self.progress.status = ScanStatus::Complete;
        self.controller.finish(self.generation);
        info!(
            "Scan complete: {} entities, {} tokens",
            summary.entity_count, summary.token_stats.total_tokens
        );

        self.persist_results();
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            if let Err(e) = storage.save_run_summary(summary).await {
                warn!("Failed to persist run summary: {e}");
            }
        });
    }

    /// Cancels the active job: signals the backend out-of-band, resets
    /// local state to idle, and bumps the generation so any late event
    /// from the old run is discarded.
    pub async fn stop(&mut self) {
        if let Err(e) = self.transport.stop().await {
            warn!("Failed to signal scan stop: {e}");
        }
        self.controller.cancel();
        self.progress = ScanProgress::default();
        info!("Scan cancelled; local state reset to idle");
    }

    /// Applies a user override and persists the override map in the
    /// background. The entity record itself is never mutated.
    pub fn set_override(&mut self, entity_id: &str, record: OverrideRecord) {
        self.store.set_override(entity_id, record);
        let overrides = self.store.overrides().clone();
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            if let Err(e) = storage.save_overrides(overrides).await {
                warn!("Failed to persist overrides: {e}");
            }
        });
    }

    /// True when a job is active but no event has arrived within the
    /// configured watchdog interval.
    pub fn is_stalled(&self) -> bool {
        self.progress.status.is_running()
            && self
                .last_event_at
                .is_some_and(|at| at.elapsed() > self.config.watchdog_timeout)
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn progress(&self) -> &ScanProgress {
        &self.progress
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            progress: self.progress.clone(),
            token_stats: self
                .accountant
                .stats(self.progress.processed, self.config.cost_per_token),
            entity_count: self.store.len() as u64,
            last_scan_timestamp: self.last_scan_timestamp,
            last_summary: self.last_summary.clone(),
        }
    }

    /// Dispatches a non-blocking write of the current results envelope.
    /// Never gates processing of the next event.
    fn persist_results(&self) {
        let envelope = ResultsEnvelope {
            results: self.store.to_map(),
            last_scan_timestamp: self.last_scan_timestamp,
            total_entities: self.store.len() as u64,
        };
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            if let Err(e) = storage.save_results(envelope).await {
                warn!("Failed to persist scan results: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStorage;
    use crate::stream::testing::RecordingTransport;

    fn coordinator(transport: Arc<RecordingTransport>) -> ScanCoordinator {
        ScanCoordinator::new(
            ScanConfig::default(),
            Arc::new(OperationController::new()),
            transport,
            Arc::new(MemoryStorage::new()),
        )
    }

    fn entity(id: &str, weight: u8) -> StreamEvent {
        StreamEvent::EntityResult {
            entity: EntityRecord::new(id, weight, "test"),
        }
    }

    fn batch(number: u64, in_batch: u64, remaining: u64) -> StreamEvent {
        StreamEvent::BatchInfo {
            batch_number: number,
            batch_size: 10,
            entities_in_batch: in_batch,
            remaining_entities: remaining,
            retry_attempt: 0,
            total_entities: None,
            processed_entities: None,
        }
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(Arc::clone(&transport));
        let _stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let err = coordinator.start(ScanMode::Full, vec![]).await.unwrap_err();
        assert!(matches!(err, HearthscanError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaced_distinctly() {
        let transport = Arc::new(RecordingTransport::failing());
        let mut coordinator = coordinator(transport);
        let err = coordinator.start(ScanMode::Full, vec![]).await.unwrap_err();
        assert!(matches!(err, HearthscanError::Transport(_)));
        // The failed start releases the controller for a fresh attempt.
        assert_eq!(coordinator.progress().status, ScanStatus::Idle);
    }

    #[tokio::test]
    async fn test_incremental_sends_existing_ids_and_keeps_rows() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(Arc::clone(&transport));

        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        coordinator.handle_envelope(Envelope {
            generation: stream.generation(),
            event: entity("sensor.a", 3),
        });
        coordinator.handle_envelope(Envelope {
            generation: stream.generation(),
            event: StreamEvent::ScanComplete { token_stats: None },
        });
        drop(stream);

        let _stream = coordinator
            .start(ScanMode::Incremental, vec![])
            .await
            .unwrap();
        assert_eq!(coordinator.store().len(), 1, "incremental preserves rows");
        match &transport.requests()[1] {
            OutboundRequest::StartScan {
                mode, existing_ids, ..
            } => {
                assert_eq!(*mode, ScanMode::Incremental);
                assert_eq!(existing_ids, &vec!["sensor.a".to_string()]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_scan_clears_store() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(transport);
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        coordinator.handle_envelope(Envelope {
            generation: stream.generation(),
            event: entity("sensor.a", 3),
        });
        coordinator.handle_envelope(Envelope {
            generation: stream.generation(),
            event: StreamEvent::ScanComplete { token_stats: None },
        });
        drop(stream);
        assert_eq!(coordinator.store().len(), 1);

        let _stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        assert_eq!(coordinator.store().len(), 0);
    }

    #[tokio::test]
    async fn test_processed_counts_distinct_ids() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(transport);
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let generation = stream.generation();
        for event in [
            batch(1, 2, 1),
            entity("sensor.a", 1),
            entity("sensor.a", 4),
            entity("sensor.b", 2),
        ] {
            coordinator.handle_envelope(Envelope { generation, event });
        }
        assert_eq!(coordinator.progress().processed, 2);
        assert_eq!(coordinator.progress().total_entities, Some(3));
        // Last write wins for the repeated id.
        assert_eq!(
            coordinator.store().get("sensor.a").unwrap().overall_weight,
            4
        );
    }

    #[tokio::test]
    async fn test_over_delivery_raises_inferred_total() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(transport);
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let generation = stream.generation();

        // Inferred total: 0 processed + 2 in batch + 0 remaining.
        coordinator.handle_envelope(Envelope {
            generation,
            event: batch(1, 2, 0),
        });
        assert_eq!(coordinator.progress().total_entities, Some(2));

        for event in [
            entity("sensor.a", 1),
            entity("sensor.b", 2),
            entity("sensor.c", 3),
        ] {
            coordinator.handle_envelope(Envelope { generation, event });
        }
        assert_eq!(coordinator.progress().processed, 3);
        assert_eq!(coordinator.progress().total_entities, Some(3));
    }

    #[tokio::test]
    async fn test_scan_progress_moves_between_requesting_and_processing() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(transport);
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let generation = stream.generation();
        assert_eq!(coordinator.progress().status, ScanStatus::Requesting);

        coordinator.handle_envelope(Envelope {
            generation,
            event: StreamEvent::ScanProgress {
                message: "reply received".to_string(),
                batch_number: 1,
                prompt_size: None,
                response_size: Some(800),
                compact_mode: None,
            },
        });
        assert_eq!(coordinator.progress().status, ScanStatus::Processing);

        coordinator.handle_envelope(Envelope {
            generation,
            event: StreamEvent::ScanProgress {
                message: "sending batch 2".to_string(),
                batch_number: 2,
                prompt_size: Some(400),
                response_size: None,
                compact_mode: None,
            },
        });
        assert_eq!(coordinator.progress().status, ScanStatus::Requesting);
    }

    #[tokio::test]
    async fn test_token_limit_is_terminal_and_retains_results() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(transport);
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let generation = stream.generation();
        coordinator.handle_envelope(Envelope {
            generation,
            event: batch(1, 2, 4),
        });
        coordinator.handle_envelope(Envelope {
            generation,
            event: entity("sensor.a", 3),
        });
        coordinator.handle_envelope(Envelope {
            generation,
            event: StreamEvent::TokenLimitExceeded {
                batch: 1,
                message: "limit".to_string(),
                response: None,
                compact_mode: None,
            },
        });
        assert_eq!(coordinator.progress().status, ScanStatus::Error);
        assert_eq!(coordinator.store().len(), 1, "partial results retained");

        // No batch with a higher number is accepted afterward.
        coordinator.handle_envelope(Envelope {
            generation,
            event: batch(2, 2, 2),
        });
        assert_eq!(coordinator.progress().batch_number, 1);
    }

    #[tokio::test]
    async fn test_stop_discards_pre_stop_generation_events() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(Arc::clone(&transport));
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let old_generation = stream.generation();

        coordinator.stop().await;
        assert_eq!(coordinator.progress().status, ScanStatus::Idle);
        assert_eq!(transport.stop_count(), 1);

        coordinator.handle_envelope(Envelope {
            generation: old_generation,
            event: entity("sensor.late", 5),
        });
        assert!(coordinator.store().get("sensor.late").is_none());
    }

    #[tokio::test]
    async fn test_retry_attempt_non_decreasing_within_batch() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(transport);
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let generation = stream.generation();

        coordinator.handle_envelope(Envelope {
            generation,
            event: StreamEvent::BatchSizeReduced {
                old_size: 10,
                new_size: 5,
                retry_attempt: 2,
                message: None,
            },
        });
        assert_eq!(coordinator.progress().retry_attempt, 2);

        // A lower attempt on the same batch does not regress the counter.
        coordinator.handle_envelope(Envelope {
            generation,
            event: StreamEvent::BatchInfo {
                batch_number: 0,
                batch_size: 5,
                entities_in_batch: 5,
                remaining_entities: 0,
                retry_attempt: 1,
                total_entities: None,
                processed_entities: None,
            },
        });
        assert_eq!(coordinator.progress().retry_attempt, 2);
    }

    #[tokio::test]
    async fn test_scan_complete_persists_summary_with_authoritative_stats() {
        let storage = Arc::new(MemoryStorage::new());
        let mut coordinator = ScanCoordinator::new(
            ScanConfig::default(),
            Arc::new(OperationController::new()),
            Arc::new(RecordingTransport::default()),
            Arc::clone(&storage) as Arc<dyn StorageBackend>,
        );
        let stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        let generation = stream.generation();
        coordinator.handle_envelope(Envelope {
            generation,
            event: entity("sensor.a", 3),
        });
        let backend_stats = TokenStats {
            prompt_chars: 1000,
            response_chars: 500,
            total_tokens: 375,
            average_tokens_per_entity: 375,
            estimated_cost: 0.01,
        };
        coordinator.handle_envelope(Envelope {
            generation,
            event: StreamEvent::ScanComplete {
                token_stats: Some(backend_stats.clone()),
            },
        });
        assert_eq!(coordinator.progress().status, ScanStatus::Complete);
        assert_eq!(coordinator.snapshot().token_stats, backend_stats);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        let summaries = storage.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].entity_count, 1);
        assert_eq!(summaries[0].token_stats, backend_stats);
    }

    #[tokio::test]
    async fn test_watchdog_reports_stalled_job() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = ScanCoordinator::new(
            ScanConfig {
                watchdog_timeout: std::time::Duration::ZERO,
                ..ScanConfig::default()
            },
            Arc::new(OperationController::new()),
            transport,
            Arc::new(MemoryStorage::new()),
        );
        assert!(!coordinator.is_stalled());
        let _stream = coordinator.start(ScanMode::Full, vec![]).await.unwrap();
        assert!(coordinator.is_stalled());
    }
}
