//! Correlation discovery: a second job type that relates already
//! classified entities to each other.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::control::OperationController;
use crate::error::{HearthscanError, Result};
use crate::persist::StorageBackend;
use crate::store::{CategoryFilter, ResultStore};
use crate::stream::{
    CorrelationSeed, Envelope, OutboundRequest, ProgressStream, ScanTransport, StreamEvent,
};

/// Qualitative kind of a discovered relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationType {
    Functional,
    Location,
    Temporal,
    DataDependency,
}

/// A discovered relationship from a source entity (the map key it is
/// stored under) to a target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub target_entity_id: String,
    pub correlation_type: CorrelationType,
    /// 1 (weak) to 5 (strong); clamped on ingest.
    pub strength: u8,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatus {
    #[default]
    Idle,
    Running,
    Complete,
    Error,
}

/// Progress of the in-flight correlation job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationProgress {
    pub status: CorrelationStatus,
    pub current: u64,
    pub total: u64,
    pub message: String,
}

/// Drives a correlation-discovery job over a frozen subset of classified
/// entities, streaming results straight through to persistence so a
/// cancelled job never loses what it already found.
pub struct CorrelationAnalyzer {
    controller: Arc<OperationController>,
    transport: Arc<dyn ScanTransport>,
    storage: Arc<dyn StorageBackend>,
    correlations: HashMap<String, Vec<Correlation>>,
    progress: CorrelationProgress,
    generation: u64,
}

impl CorrelationAnalyzer {
    pub fn new(
        controller: Arc<OperationController>,
        transport: Arc<dyn ScanTransport>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            controller,
            transport,
            storage,
            correlations: HashMap::new(),
            progress: CorrelationProgress::default(),
            generation: 0,
        }
    }

    /// Captures the input entity list from the store with the filter
    /// active right now. Later filter changes do not affect a job already
    /// submitted from this snapshot.
    pub fn seeds(
        store: &ResultStore,
        min_weight: u8,
        filter: CategoryFilter,
        search: &str,
    ) -> Vec<CorrelationSeed> {
        store
            .query(min_weight, filter, search)
            .into_iter()
            .map(|record| {
                let weight = store.effective_weight(&record.entity_id).unwrap_or(0);
                CorrelationSeed::from_record(record, weight)
            })
            .collect()
    }

    /// Submits a correlation job over the given seed entities.
    pub async fn start(
        &mut self,
        seeds: Vec<CorrelationSeed>,
        language: &str,
    ) -> Result<ProgressStream> {
        if self.progress.status == CorrelationStatus::Running {
            return Err(HearthscanError::Protocol(
                "a correlation job is already running".to_string(),
            ));
        }
        let generation = self.controller.begin().ok_or_else(|| {
            HearthscanError::Protocol("another job is already active".to_string())
        })?;

        let total = seeds.len() as u64;
        let (handle, stream) = ProgressStream::open(generation);
        let request = OutboundRequest::StartCorrelation {
            entities: seeds,
            language: language.to_string(),
        };
        if let Err(e) = self.transport.submit(request, handle).await {
            self.controller.finish(generation);
            return Err(e.into());
        }

        self.generation = generation;
        self.progress = CorrelationProgress {
            status: CorrelationStatus::Running,
            current: 0,
            total,
            message: String::new(),
        };
        info!("Correlation job started over {total} entities (generation {generation})");
        Ok(stream)
    }

    /// Consumes events until the job terminates.
    pub async fn run(&mut self, mut stream: ProgressStream) -> Result<()> {
        while let Some(envelope) = stream.recv().await {
            self.handle_envelope(envelope);
            match self.progress.status {
                CorrelationStatus::Complete => return Ok(()),
                CorrelationStatus::Error => return Err(HearthscanError::CorrelationFailed),
                _ => {}
            }
        }
        self.controller.finish(self.generation);
        self.progress.status = CorrelationStatus::Error;
        Err(crate::error::TransportError::ChannelClosed.into())
    }

    /// Applies one inbound event. Stale-generation events are discarded.
    pub fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.generation != self.generation || !self.controller.is_current(envelope.generation)
        {
            debug!(
                "Discarding stale correlation event (generation {} != {})",
                envelope.generation, self.generation
            );
            return;
        }
        if self.progress.status != CorrelationStatus::Running {
            debug!("Discarding correlation event outside a running job");
            return;
        }

        match envelope.event {
            StreamEvent::CorrelationProgress {
                current,
                total,
                message,
            } => {
                self.progress.current = current;
                self.progress.total = total;
                self.progress.message = message;
            }
            StreamEvent::CorrelationResult {
                entity_id,
                correlations,
            } => {
                let normalized: Vec<Correlation> = correlations
                    .into_iter()
                    .map(|mut c| {
                        c.strength = c.strength.clamp(1, 5);
                        c
                    })
                    .collect();
                // Replace, never append: the latest list for an id wins.
                self.correlations
                    .insert(entity_id.clone(), normalized.clone());
                let storage = Arc::clone(&self.storage);
                tokio::spawn(async move {
                    if let Err(e) = storage.save_correlations(&entity_id, normalized).await {
                        warn!("Failed to persist correlations for {entity_id}: {e}");
                    }
                });
            }
            StreamEvent::CorrelationComplete { message } => {
                self.progress.status = CorrelationStatus::Complete;
                self.progress.message = message.unwrap_or_default();
                self.controller.finish(self.generation);
                info!(
                    "Correlation job complete: {} entities with correlations",
                    self.correlations.len()
                );
            }
            StreamEvent::CorrelationError {} => {
                self.progress.status = CorrelationStatus::Error;
                self.controller.finish(self.generation);
                warn!("Correlation job failed; already-persisted results are kept");
            }
            other => {
                warn!("Skipping non-correlation event on correlation stream: {other:?}");
            }
        }
    }

    /// Cancels the in-flight job. Correlations already written through to
    /// persistence are kept.
    pub async fn stop(&mut self) {
        if let Err(e) = self.transport.stop().await {
            warn!("Failed to signal correlation stop: {e}");
        }
        self.controller.cancel();
        self.progress = CorrelationProgress::default();
    }

    pub fn progress(&self) -> &CorrelationProgress {
        &self.progress
    }

    pub fn correlations_for(&self, entity_id: &str) -> Option<&[Correlation]> {
        self.correlations.get(entity_id).map(Vec::as_slice)
    }

    pub fn correlations(&self) -> &HashMap<String, Vec<Correlation>> {
        &self.correlations
    }

    /// Seeds the in-memory table from previously persisted correlations.
    pub fn hydrate(&mut self, correlations: HashMap<String, Vec<Correlation>>) {
        self.correlations = correlations;
    }
}
