//! External collaborator seams: durable storage and the monitoring
//! service. The subsystem persists through these traits but owns neither
//! durability nor threshold evaluation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accounting::TokenStats;
use crate::correlation::Correlation;
use crate::error::{StorageError, TransportError};
use crate::store::{CategoryFilter, EntityRecord, OverrideRecord};
use crate::thresholds::{AlertLevel, Threshold};

/// Persisted results record: the classified entities of the last run plus
/// scan metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsEnvelope {
    pub results: HashMap<String, EntityRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_entities: u64,
}

/// Immutable summary persisted when a scan completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub entity_count: u64,
    pub token_stats: TokenStats,
}

impl RunSummary {
    pub fn new(entity_count: u64, token_stats: TokenStats) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            entity_count,
            token_stats,
        }
    }
}

/// The active scope pushed to the monitoring service: only entities at or
/// above `min_weight` and inside the category are evaluated for alerts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorFilter {
    pub min_weight: u8,
    pub category: CategoryFilter,
}

/// Monitoring service status, re-read after a filter push to reconcile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub monitoring_enabled: bool,
    pub total_monitored: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

/// Durable storage for results, overrides, correlations, thresholds and
/// run summaries. Owned externally; durability guarantees are not this
/// subsystem's concern.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn save_results(&self, envelope: ResultsEnvelope) -> Result<(), StorageError>;
    async fn load_results(&self) -> Result<Option<ResultsEnvelope>, StorageError>;

    async fn save_overrides(
        &self,
        overrides: HashMap<String, OverrideRecord>,
    ) -> Result<(), StorageError>;
    async fn load_overrides(&self) -> Result<HashMap<String, OverrideRecord>, StorageError>;

    /// Written through immediately per correlation result, so a cancelled
    /// job never loses already-discovered correlations.
    async fn save_correlations(
        &self,
        entity_id: &str,
        correlations: Vec<Correlation>,
    ) -> Result<(), StorageError>;
    async fn load_correlations(&self)
        -> Result<HashMap<String, Vec<Correlation>>, StorageError>;

    async fn save_thresholds(
        &self,
        entity_id: &str,
        thresholds: BTreeMap<AlertLevel, Threshold>,
    ) -> Result<(), StorageError>;
    async fn load_thresholds(
        &self,
    ) -> Result<HashMap<String, BTreeMap<AlertLevel, Threshold>>, StorageError>;

    async fn save_run_summary(&self, summary: RunSummary) -> Result<(), StorageError>;
}

/// The background monitoring service evaluating thresholds.
#[async_trait]
pub trait MonitoringBackend: Send + Sync {
    async fn push_filter(&self, filter: MonitorFilter) -> Result<(), TransportError>;
    async fn status(&self) -> Result<MonitorStatus, TransportError>;
}

/// In-memory storage backend for tests and embedding without a real store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    results: Mutex<Option<ResultsEnvelope>>,
    overrides: Mutex<HashMap<String, OverrideRecord>>,
    correlations: Mutex<HashMap<String, Vec<Correlation>>>,
    thresholds: Mutex<HashMap<String, BTreeMap<AlertLevel, Threshold>>>,
    summaries: Mutex<Vec<RunSummary>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.lock().expect("summaries lock").clone()
    }

    pub fn correlations_for(&self, entity_id: &str) -> Option<Vec<Correlation>> {
        self.correlations
            .lock()
            .expect("correlations lock")
            .get(entity_id)
            .cloned()
    }

    pub fn saved_results(&self) -> Option<ResultsEnvelope> {
        self.results.lock().expect("results lock").clone()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn save_results(&self, envelope: ResultsEnvelope) -> Result<(), StorageError> {
        *self.results.lock().expect("results lock") = Some(envelope);
        Ok(())
    }

    async fn load_results(&self) -> Result<Option<ResultsEnvelope>, StorageError> {
        Ok(self.results.lock().expect("results lock").clone())
    }

    async fn save_overrides(
        &self,
        overrides: HashMap<String, OverrideRecord>,
    ) -> Result<(), StorageError> {
        *self.overrides.lock().expect("overrides lock") = overrides;
        Ok(())
    }

    async fn load_overrides(&self) -> Result<HashMap<String, OverrideRecord>, StorageError> {
        Ok(self.overrides.lock().expect("overrides lock").clone())
    }

    async fn save_correlations(
        &self,
        entity_id: &str,
        correlations: Vec<Correlation>,
    ) -> Result<(), StorageError> {
        self.correlations
            .lock()
            .expect("correlations lock")
            .insert(entity_id.to_string(), correlations);
        Ok(())
    }

    async fn load_correlations(
        &self,
    ) -> Result<HashMap<String, Vec<Correlation>>, StorageError> {
        Ok(self.correlations.lock().expect("correlations lock").clone())
    }

    async fn save_thresholds(
        &self,
        entity_id: &str,
        thresholds: BTreeMap<AlertLevel, Threshold>,
    ) -> Result<(), StorageError> {
        self.thresholds
            .lock()
            .expect("thresholds lock")
            .insert(entity_id.to_string(), thresholds);
        Ok(())
    }

    async fn load_thresholds(
        &self,
    ) -> Result<HashMap<String, BTreeMap<AlertLevel, Threshold>>, StorageError> {
        Ok(self.thresholds.lock().expect("thresholds lock").clone())
    }

    async fn save_run_summary(&self, summary: RunSummary) -> Result<(), StorageError> {
        self.summaries.lock().expect("summaries lock").push(summary);
        Ok(())
    }
}

/// In-memory monitoring backend recording the last pushed filter.
#[derive(Debug, Default)]
pub struct MemoryMonitoring {
    last_filter: Mutex<Option<MonitorFilter>>,
}

impl MemoryMonitoring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_filter(&self) -> Option<MonitorFilter> {
        *self.last_filter.lock().expect("filter lock")
    }
}

#[async_trait]
impl MonitoringBackend for MemoryMonitoring {
    async fn push_filter(&self, filter: MonitorFilter) -> Result<(), TransportError> {
        *self.last_filter.lock().expect("filter lock") = Some(filter);
        Ok(())
    }

    async fn status(&self) -> Result<MonitorStatus, TransportError> {
        let filter = self.last_filter();
        Ok(MonitorStatus {
            monitoring_enabled: filter.is_some(),
            total_monitored: 0,
            last_check: Some(Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_results_roundtrip() {
        let storage = MemoryStorage::new();
        let envelope = ResultsEnvelope {
            results: HashMap::from([(
                "sensor.a".to_string(),
                EntityRecord::new("sensor.a", 3, "reason"),
            )]),
            last_scan_timestamp: Some(Utc::now()),
            total_entities: 1,
        };
        storage.save_results(envelope).await.unwrap();
        let loaded = storage.load_results().await.unwrap().unwrap();
        assert_eq!(loaded.total_entities, 1);
        assert!(loaded.results.contains_key("sensor.a"));
    }

    #[tokio::test]
    async fn test_memory_monitoring_records_filter() {
        let monitoring = MemoryMonitoring::new();
        assert!(monitoring.last_filter().is_none());
        monitoring
            .push_filter(MonitorFilter {
                min_weight: 3,
                category: CategoryFilter::All,
            })
            .await
            .unwrap();
        assert_eq!(monitoring.last_filter().unwrap().min_weight, 3);
        assert!(monitoring.status().await.unwrap().monitoring_enabled);
    }
}
