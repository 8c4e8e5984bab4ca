//! Per-entity alert-threshold configuration and monitoring sync.
//!
//! Two independent concerns live here: a coarse severity classification
//! used to group ALERTS-category entities, and fine-grained per-level
//! threshold triples with manual > AI-suggested > unset resolution.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};
use crate::persist::{MonitorFilter, MonitoringBackend, StorageBackend};
use crate::store::{CategoryFilter, EntityCategory, ResultStore};

/// Alert severity level a threshold is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Warning,
    Alert,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "WARNING"),
            AlertLevel::Alert => write!(f, "ALERT"),
            AlertLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Comparison operator of a threshold condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOperator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ThresholdOperator {
    /// Ordering operators compare numerically; equality operators also
    /// accept symbolic states like "offline".
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::Lt | Self::Gt | Self::Le | Self::Ge)
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "<" | "lt" | "below" => Some(Self::Lt),
            ">" | "gt" | "above" => Some(Self::Gt),
            "<=" | "le" => Some(Self::Le),
            ">=" | "ge" => Some(Self::Ge),
            "==" | "=" | "eq" | "equals" => Some(Self::Eq),
            "!=" | "ne" => Some(Self::Ne),
            _ => None,
        }
    }
}

/// Threshold comparison value: numeric, or a symbolic state string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdValue {
    Number(f64),
    Symbol(String),
}

/// Canonical threshold shape. Legacy suggestion payloads are normalized to
/// this at the ingress boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub operator: ThresholdOperator,
    pub value: ThresholdValue,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manual: bool,
}

/// Accepts both legacy suggestion shapes: `{value, condition}` and
/// `{value, operator, description}`.
#[derive(Debug, Deserialize)]
struct RawThreshold {
    value: serde_json::Value,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl RawThreshold {
    fn normalize(self) -> Option<Threshold> {
        let operator = self
            .operator
            .as_deref()
            .or(self.condition.as_deref())
            .and_then(ThresholdOperator::parse)?;
        let value = match self.value {
            serde_json::Value::Number(n) => ThresholdValue::Number(n.as_f64()?),
            serde_json::Value::String(s) => ThresholdValue::Symbol(s),
            serde_json::Value::Bool(b) => ThresholdValue::Symbol(b.to_string()),
            _ => return None,
        };
        Some(Threshold {
            operator,
            value,
            description: self.description.unwrap_or_default(),
            manual: false,
        })
    }
}

/// Coarse grouping of ALERTS-category entities for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Medium,
    Severe,
    Critical,
}

impl Severity {
    /// Weight 5 is critical, 4 severe, everything else medium.
    pub fn from_weight(weight: u8) -> Self {
        match weight {
            5.. => Severity::Critical,
            4 => Severity::Severe,
            _ => Severity::Medium,
        }
    }
}

/// Result of resolving a threshold for an (entity, level) pair.
#[derive(Debug, PartialEq)]
pub enum ResolvedThreshold<'a> {
    Manual(&'a Threshold),
    Suggested(&'a Threshold),
    /// Neither a manual nor a suggested value exists; the caller must
    /// prompt for one.
    Unset,
}

type ThresholdMap = BTreeMap<AlertLevel, Threshold>;

/// Per-entity threshold configuration, resolution, and monitoring sync.
pub struct AlertThresholdManager {
    storage: Arc<dyn StorageBackend>,
    monitoring: Arc<dyn MonitoringBackend>,
    manual: HashMap<String, ThresholdMap>,
    suggested: HashMap<String, ThresholdMap>,
    filter: MonitorFilter,
}

impl AlertThresholdManager {
    pub fn new(storage: Arc<dyn StorageBackend>, monitoring: Arc<dyn MonitoringBackend>) -> Self {
        Self {
            storage,
            monitoring,
            manual: HashMap::new(),
            suggested: HashMap::new(),
            filter: MonitorFilter::default(),
        }
    }

    /// Loads previously saved manual thresholds from storage.
    pub async fn load(&mut self) -> Result<()> {
        self.manual = self.storage.load_thresholds().await?;
        debug!("Loaded manual thresholds for {} entities", self.manual.len());
        Ok(())
    }

    /// Ingests AI-suggested thresholds for an entity, accepting either
    /// legacy payload shape. Malformed entries are logged and skipped.
    pub fn ingest_suggestions(
        &mut self,
        entity_id: &str,
        suggestions: BTreeMap<AlertLevel, serde_json::Value>,
    ) {
        let mut normalized = ThresholdMap::new();
        for (level, payload) in suggestions {
            let raw: RawThreshold = match serde_json::from_value(payload) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping malformed threshold suggestion for {entity_id} ({level}): {e}");
                    continue;
                }
            };
            match raw.normalize() {
                Some(threshold) => {
                    normalized.insert(level, threshold);
                }
                None => {
                    warn!("Skipping unnormalizable threshold suggestion for {entity_id} ({level})");
                }
            }
        }
        if !normalized.is_empty() {
            self.suggested.insert(entity_id.to_string(), normalized);
        }
    }

    /// Resolution order: manually-saved value, else AI-suggested, else
    /// unset.
    pub fn resolve(&self, entity_id: &str, level: AlertLevel) -> ResolvedThreshold<'_> {
        if let Some(threshold) = self.manual.get(entity_id).and_then(|m| m.get(&level)) {
            return ResolvedThreshold::Manual(threshold);
        }
        if let Some(threshold) = self.suggested.get(entity_id).and_then(|m| m.get(&level)) {
            return ResolvedThreshold::Suggested(threshold);
        }
        ResolvedThreshold::Unset
    }

    /// Saves a manually-edited threshold.
    ///
    /// Validates a non-empty value before any network call; coerces to
    /// numeric only for ordering operators when the input parses as a
    /// number, otherwise the value is kept as a symbolic string. The local
    /// cache updates before the persistence write so a concurrent reader
    /// sees the new value immediately.
    pub async fn save_threshold(
        &mut self,
        entity_id: &str,
        level: AlertLevel,
        operator: ThresholdOperator,
        raw_value: &str,
        description: &str,
    ) -> Result<Threshold> {
        let trimmed = raw_value.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyThresholdValue {
                entity_id: entity_id.to_string(),
                level: level.to_string(),
            }
            .into());
        }

        let value = match trimmed.parse::<f64>() {
            Ok(n) if operator.is_ordering() => ThresholdValue::Number(n),
            _ => ThresholdValue::Symbol(trimmed.to_string()),
        };
        let threshold = Threshold {
            operator,
            value,
            description: description.to_string(),
            manual: true,
        };

        let map = self.manual.entry(entity_id.to_string()).or_default();
        map.insert(level, threshold.clone());
        let snapshot = map.clone();
        self.storage.save_thresholds(entity_id, snapshot).await?;
        info!("Saved {level} threshold for {entity_id}");
        Ok(threshold)
    }

    pub fn active_filter(&self) -> MonitorFilter {
        self.filter
    }

    /// Updates the active weight/category filter and pushes it to the
    /// monitoring backend so only in-scope entities are evaluated.
    ///
    /// The push is fire-and-forget, reconciled by re-reading monitoring
    /// status afterward; it is not transactional with the local change.
    pub fn set_filter(&mut self, min_weight: u8, category: CategoryFilter) {
        self.filter = MonitorFilter {
            min_weight: min_weight.min(5),
            category,
        };
        let filter = self.filter;
        let monitoring = Arc::clone(&self.monitoring);
        tokio::spawn(async move {
            if let Err(e) = monitoring.push_filter(filter).await {
                warn!("Failed to push monitoring filter: {e}");
                return;
            }
            match monitoring.status().await {
                Ok(status) => debug!(
                    "Monitoring reconciled: {} entities in scope",
                    status.total_monitored
                ),
                Err(e) => warn!("Failed to re-read monitoring status: {e}"),
            }
        });
    }

    /// Groups ALERTS-category entities by coarse severity using effective
    /// weights from the store.
    pub fn severity_groups(&self, store: &ResultStore) -> BTreeMap<Severity, Vec<String>> {
        let mut groups: BTreeMap<Severity, Vec<String>> = BTreeMap::new();
        for record in store.query(0, CategoryFilter::Only(EntityCategory::Alerts), "") {
            let weight = store.effective_weight(&record.entity_id).unwrap_or(0);
            groups
                .entry(Severity::from_weight(weight))
                .or_default()
                .push(record.entity_id.clone());
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryMonitoring, MemoryStorage};
    use crate::store::EntityRecord;
    use serde_json::json;

    fn manager() -> AlertThresholdManager {
        AlertThresholdManager::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryMonitoring::new()),
        )
    }

    #[tokio::test]
    async fn test_save_and_resolve_roundtrip() {
        let mut manager = manager();
        let saved = manager
            .save_threshold(
                "sensor.gate_battery",
                AlertLevel::Warning,
                ThresholdOperator::Lt,
                "20",
                "low battery",
            )
            .await
            .unwrap();
        assert_eq!(saved.value, ThresholdValue::Number(20.0));
        assert_eq!(saved.description, "low battery");
        match manager.resolve("sensor.gate_battery", AlertLevel::Warning) {
            ResolvedThreshold::Manual(t) => assert_eq!(*t, saved),
            other => panic!("expected manual threshold, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_value_rejected_before_save() {
        let mut manager = manager();
        let err = manager
            .save_threshold(
                "sensor.x",
                AlertLevel::Alert,
                ThresholdOperator::Gt,
                "   ",
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::HearthscanError::Validation(_)
        ));
        assert_eq!(
            manager.resolve("sensor.x", AlertLevel::Alert),
            ResolvedThreshold::Unset
        );
    }

    #[tokio::test]
    async fn test_symbolic_value_retained_for_equality() {
        let mut manager = manager();
        let saved = manager
            .save_threshold(
                "binary_sensor.router",
                AlertLevel::Critical,
                ThresholdOperator::Eq,
                "offline",
                "router down",
            )
            .await
            .unwrap();
        assert_eq!(saved.value, ThresholdValue::Symbol("offline".to_string()));
    }

    #[tokio::test]
    async fn test_numeric_string_stays_symbolic_for_equality() {
        // Coercion applies only to ordering operators.
        let mut manager = manager();
        let saved = manager
            .save_threshold(
                "sensor.mode",
                AlertLevel::Warning,
                ThresholdOperator::Ne,
                "3",
                "",
            )
            .await
            .unwrap();
        assert_eq!(saved.value, ThresholdValue::Symbol("3".to_string()));
    }

    #[test]
    fn test_both_legacy_shapes_normalize() {
        let mut manager = manager();
        manager.ingest_suggestions(
            "sensor.cellar_temp",
            BTreeMap::from([
                (AlertLevel::Warning, json!({"value": 28, "condition": ">"})),
                (
                    AlertLevel::Critical,
                    json!({"value": 35, "operator": ">", "description": "heat"}),
                ),
            ]),
        );
        match manager.resolve("sensor.cellar_temp", AlertLevel::Warning) {
            ResolvedThreshold::Suggested(t) => {
                assert_eq!(t.operator, ThresholdOperator::Gt);
                assert_eq!(t.value, ThresholdValue::Number(28.0));
                assert!(!t.manual);
            }
            other => panic!("expected suggested threshold, got {other:?}"),
        }
        match manager.resolve("sensor.cellar_temp", AlertLevel::Critical) {
            ResolvedThreshold::Suggested(t) => assert_eq!(t.description, "heat"),
            other => panic!("expected suggested threshold, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_manual_wins_over_suggested() {
        let mut manager = manager();
        manager.ingest_suggestions(
            "sensor.co2",
            BTreeMap::from([(AlertLevel::Alert, json!({"value": 1000, "condition": ">"}))]),
        );
        manager
            .save_threshold(
                "sensor.co2",
                AlertLevel::Alert,
                ThresholdOperator::Gt,
                "1200",
                "ventilate",
            )
            .await
            .unwrap();
        match manager.resolve("sensor.co2", AlertLevel::Alert) {
            ResolvedThreshold::Manual(t) => {
                assert_eq!(t.value, ThresholdValue::Number(1200.0));
            }
            other => panic!("expected manual threshold, got {other:?}"),
        }
    }

    #[test]
    fn test_severity_from_weight() {
        assert_eq!(Severity::from_weight(5), Severity::Critical);
        assert_eq!(Severity::from_weight(4), Severity::Severe);
        assert_eq!(Severity::from_weight(3), Severity::Medium);
        assert_eq!(Severity::from_weight(0), Severity::Medium);
    }

    #[test]
    fn test_severity_groups_alerts_only() {
        let manager = manager();
        let mut store = ResultStore::new();
        store.upsert(EntityRecord::new("sensor.smoke", 5, "").with_category(EntityCategory::Alerts));
        store.upsert(EntityRecord::new("sensor.door", 4, "").with_category(EntityCategory::Alerts));
        store.upsert(EntityRecord::new("light.hall", 5, "").with_category(EntityCategory::Control));

        let groups = manager.severity_groups(&store);
        assert_eq!(groups[&Severity::Critical], vec!["sensor.smoke"]);
        assert_eq!(groups[&Severity::Severe], vec!["sensor.door"]);
        assert!(!groups.contains_key(&Severity::Medium));
    }

    #[tokio::test]
    async fn test_set_filter_pushes_to_monitoring() {
        let monitoring = Arc::new(MemoryMonitoring::new());
        let mut manager = AlertThresholdManager::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&monitoring) as Arc<dyn MonitoringBackend>,
        );
        manager.set_filter(4, CategoryFilter::Only(EntityCategory::Alerts));
        // Fire-and-forget push; yield so the spawned task runs.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let pushed = monitoring.last_filter();
        assert_eq!(pushed.map(|f| f.min_weight), Some(4));
        assert_eq!(manager.active_filter().min_weight, 4);
    }
}
