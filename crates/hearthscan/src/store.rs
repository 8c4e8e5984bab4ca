//! In-memory table of classified entities plus user overrides.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::thresholds::{AlertLevel, Threshold};

/// Classification category assigned by the AI provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityCategory {
    Data,
    Control,
    Alerts,
    Health,
}

impl std::fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityCategory::Data => write!(f, "DATA"),
            EntityCategory::Control => write!(f, "CONTROL"),
            EntityCategory::Alerts => write!(f, "ALERTS"),
            EntityCategory::Health => write!(f, "HEALTH"),
        }
    }
}

/// Who manages the entity, as judged by the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagementType {
    #[serde(alias = "USER")]
    User,
    #[serde(alias = "SERVICE")]
    Service,
    #[default]
    #[serde(alias = "UNKNOWN")]
    Unknown,
}

/// A classified entity as returned by the AI provider.
///
/// Keyed uniquely by `entity_id` in [`ResultStore`]; mutated only through
/// [`ResultStore::upsert`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Non-empty set; legacy payloads carry a scalar `category` string and
    /// both the scalar and the missing-field cases coerce to `{DATA}`.
    #[serde(
        rename = "category",
        alias = "categories",
        default = "default_categories",
        deserialize_with = "deserialize_categories"
    )]
    pub categories: BTreeSet<EntityCategory>,
    #[serde(default)]
    pub overall_weight: u8,
    #[serde(default)]
    pub overall_reason: String,
    /// Opaque structured payload from the provider (domain, state,
    /// weighted attributes). Not interpreted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_details: Option<serde_json::Value>,
    #[serde(default)]
    pub management_type: ManagementType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alert_thresholds: BTreeMap<AlertLevel, Threshold>,
}

fn default_categories() -> BTreeSet<EntityCategory> {
    BTreeSet::from([EntityCategory::Data])
}

/// Accepts either the legacy scalar form (`"category": "DATA"`) or the
/// list form (`"category": ["DATA", "ALERTS"]`).
fn deserialize_categories<'de, D>(deserializer: D) -> Result<BTreeSet<EntityCategory>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(EntityCategory),
        Many(Vec<EntityCategory>),
    }

    let set = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(category) => BTreeSet::from([category]),
        OneOrMany::Many(list) => list.into_iter().collect(),
    };
    if set.is_empty() {
        return Ok(default_categories());
    }
    Ok(set)
}

impl EntityRecord {
    pub fn new(entity_id: &str, weight: u8, reason: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            name: None,
            categories: default_categories(),
            overall_weight: weight.min(5),
            overall_reason: reason.to_string(),
            analysis_details: None,
            management_type: ManagementType::Unknown,
            alert_thresholds: BTreeMap::new(),
        }
    }

    pub fn with_category(mut self, category: EntityCategory) -> Self {
        self.categories = BTreeSet::from([category]);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// User-supplied values taking read-time precedence over the AI-derived
/// weight and enabled flag. Never mutates the entity record itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_weight: Option<u8>,
}

/// Category filter used by queries and the monitoring sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CategoryFilter {
    #[default]
    All,
    #[serde(untagged)]
    Only(EntityCategory),
}

impl CategoryFilter {
    fn matches(&self, record: &EntityRecord) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Only(category) => record.categories.contains(category),
        }
    }
}

/// In-memory table of classified entities plus overrides.
#[derive(Debug, Default)]
pub struct ResultStore {
    entities: HashMap<String, EntityRecord>,
    overrides: HashMap<String, OverrideRecord>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or wholesale-replaces the record for its id.
    ///
    /// Normalizes the category set (empty coerces to `{DATA}`) and clamps
    /// the weight into 0-5. Returns true when the id was not present
    /// before.
    pub fn upsert(&mut self, mut record: EntityRecord) -> bool {
        if record.categories.is_empty() {
            record.categories = default_categories();
        }
        record.overall_weight = record.overall_weight.min(5);
        self.entities
            .insert(record.entity_id.clone(), record)
            .is_none()
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityRecord> {
        self.entities.get(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn set_override(&mut self, entity_id: &str, record: OverrideRecord) {
        self.overrides.insert(entity_id.to_string(), record);
    }

    pub fn overrides(&self) -> &HashMap<String, OverrideRecord> {
        &self.overrides
    }

    pub fn load_overrides(&mut self, overrides: HashMap<String, OverrideRecord>) {
        self.overrides = overrides;
    }

    /// Override weight if set, else the AI-derived weight.
    pub fn effective_weight(&self, entity_id: &str) -> Option<u8> {
        let record = self.entities.get(entity_id)?;
        let weight = self
            .overrides
            .get(entity_id)
            .and_then(|o| o.overall_weight)
            .unwrap_or(record.overall_weight);
        Some(weight.min(5))
    }

    /// Override enabled flag if set, else true.
    pub fn effective_enabled(&self, entity_id: &str) -> bool {
        self.overrides
            .get(entity_id)
            .and_then(|o| o.enabled)
            .unwrap_or(true)
    }

    /// Returns entities with `effective_weight >= min_weight`, matching the
    /// category filter and the case-insensitive search on id or name,
    /// sorted by effective weight descending with stable ties.
    pub fn query(&self, min_weight: u8, filter: CategoryFilter, search: &str) -> Vec<&EntityRecord> {
        let needle = search.to_lowercase();
        let mut matches: Vec<&EntityRecord> = self
            .entities
            .values()
            .filter(|record| self.effective_weight(&record.entity_id).unwrap_or(0) >= min_weight)
            .filter(|record| filter.matches(record))
            .filter(|record| {
                needle.is_empty()
                    || record.entity_id.to_lowercase().contains(&needle)
                    || record
                        .name
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase().contains(&needle))
            })
            .collect();
        // Pre-sort by id so equal weights order deterministically, then the
        // stable weight sort preserves that order.
        matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        matches.sort_by(|a, b| {
            let wa = self.effective_weight(&a.entity_id).unwrap_or(0);
            let wb = self.effective_weight(&b.entity_id).unwrap_or(0);
            wb.cmp(&wa)
        });
        matches
    }

    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    pub fn to_map(&self) -> HashMap<String, EntityRecord> {
        self.entities.clone()
    }

    pub fn load(&mut self, entities: HashMap<String, EntityRecord>) {
        self.entities = entities;
    }
}
