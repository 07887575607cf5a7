//! In-memory semantic store.
//!
//! Holds records as `key -> attribute -> values` and evaluates the rendered
//! query syntax directly. Used by the `sdu` CLI (loaded from a YAML or JSON
//! snapshot) and by the integration tests.
//!
//! Query semantics:
//! - `[[A||B]]` matches the records keyed `A` or `B`
//! - `[[Prop::X||Y]]` matches records whose `Prop` holds `X` or `Y`
//! - `+` as a value matches anything (`[[Prop::+]]` = has any `Prop` value)
//! - conditions in one conjunction must all match; disjuncts are alternatives
//!
//! Keys and attribute names are normalized the way the host stores them:
//! surrounding whitespace trimmed, inner spaces replaced by `_`.

use super::traits::{AttributeCatalog, QueryExecutor, QueryRequest, QueryResponse};
use crate::dispatch::{RefreshError, RefreshService, TaskKind};
use crate::notification::{normalize_key, AttributeId, DataValue};
use crate::query::{Condition, QueryExpr};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::RwLock;

const WILDCARD: &str = "+";

type Attributes = BTreeMap<String, Vec<DataValue>>;

/// Serialized form of a store, as read from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Attribute name -> numeric id used in diff tables
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeId>,
    /// Record key -> attribute name -> values
    #[serde(default)]
    pub records: BTreeMap<String, Attributes>,
}

/// Records, attribute catalog and refresh counters held in memory.
///
/// ```
/// use dependency_updater::store::{MemoryStore, QueryExecutor, QueryRequest};
/// # tokio_test::block_on(async {
/// let store = MemoryStore::from_yaml_str("records:\n  Team_A: {}\n").unwrap();
/// let response = store
///     .execute(&QueryRequest::new("[[Team A]]", 10))
///     .await
///     .unwrap();
/// assert_eq!(response.record_ids, vec!["Team_A"]);
/// # });
/// ```
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Attributes>>,
    catalog: HashMap<String, AttributeId>,
    refreshes: RwLock<HashMap<String, u32>>,
    rebuilds: RwLock<HashMap<String, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let records = snapshot
            .records
            .into_iter()
            .map(|(key, attrs)| {
                let attrs = attrs
                    .into_iter()
                    .map(|(name, values)| (normalize_key(&name), values))
                    .collect();
                (normalize_key(&key), attrs)
            })
            .collect();
        let catalog = snapshot
            .attributes
            .into_iter()
            .map(|(name, id)| (normalize_key(&name), id))
            .collect();
        Self {
            records: RwLock::new(records),
            catalog,
            refreshes: RwLock::new(HashMap::new()),
            rebuilds: RwLock::new(HashMap::new()),
        }
    }

    /// Parse a snapshot from YAML (JSON is accepted as well).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let snapshot: StoreSnapshot =
            serde_yaml::from_str(content).context("Failed to parse store snapshot")?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Load a snapshot file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read store snapshot {}", path.display()))?;
        let store = Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid store snapshot {}", path.display()))?;
        tracing::info!("Loaded store snapshot from {}", path.display());
        Ok(store)
    }

    pub fn with_attribute(mut self, name: &str, id: AttributeId) -> Self {
        self.catalog.insert(normalize_key(name), id);
        self
    }

    /// Insert or replace a record.
    pub async fn put_record<I, S>(&self, key: &str, attributes: I)
    where
        I: IntoIterator<Item = (S, Vec<DataValue>)>,
        S: AsRef<str>,
    {
        let attrs = attributes
            .into_iter()
            .map(|(name, values)| (normalize_key(name.as_ref()), values))
            .collect();
        self.records.write().await.insert(normalize_key(key), attrs);
    }

    /// Replace the values of one attribute, creating the record if needed.
    pub async fn set_values(&self, key: &str, attribute: &str, values: Vec<DataValue>) {
        self.records
            .write()
            .await
            .entry(normalize_key(key))
            .or_default()
            .insert(normalize_key(attribute), values);
    }

    pub async fn remove_record(&self, key: &str) -> bool {
        self.records
            .write()
            .await
            .remove(&normalize_key(key))
            .is_some()
    }

    pub async fn values(&self, key: &str, attribute: &str) -> Vec<DataValue> {
        self.records
            .read()
            .await
            .get(&normalize_key(key))
            .and_then(|attrs| attrs.get(&normalize_key(attribute)))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// How many times `key` has been refreshed.
    pub async fn refresh_count(&self, key: &str) -> u32 {
        self.refreshes
            .read()
            .await
            .get(&normalize_key(key))
            .copied()
            .unwrap_or(0)
    }

    /// How many of those refreshes rebuilt the record's semantic data.
    pub async fn rebuild_count(&self, key: &str) -> u32 {
        self.rebuilds
            .read()
            .await
            .get(&normalize_key(key))
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_refreshes(&self) -> u32 {
        self.refreshes.read().await.values().sum()
    }
}

fn value_matches(value: &DataValue, needle: &str) -> bool {
    needle == WILDCARD || value.matches(needle) || value.matches(&normalize_key(needle))
}

fn condition_matches(key: &str, attrs: &Attributes, condition: &Condition) -> bool {
    match condition.property_name() {
        None => condition
            .values()
            .iter()
            .any(|v| v == WILDCARD || normalize_key(v) == key),
        Some(property) => match attrs.get(&normalize_key(property)) {
            Some(values) => condition
                .values()
                .iter()
                .any(|needle| values.iter().any(|value| value_matches(value, needle))),
            None => false,
        },
    }
}

fn expr_matches(key: &str, attrs: &Attributes, expr: &QueryExpr) -> bool {
    expr.disjuncts().iter().any(|conj| {
        conj.conditions()
            .iter()
            .all(|c| condition_matches(key, attrs, c))
    })
}

#[async_trait]
impl QueryExecutor for MemoryStore {
    async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let expr = QueryExpr::from_str(&request.expression)
            .with_context(|| format!("Unsupported query: {}", request.expression))?;

        let records = self.records.read().await;
        let matched: Vec<String> = records
            .iter()
            .filter(|(key, attrs)| expr_matches(key, attrs, &expr))
            .map(|(key, _)| key.clone())
            .collect();

        let further_results = matched.len() > request.limit;
        tracing::debug!(
            expression = %request.expression,
            matched = matched.len(),
            "Evaluated query"
        );
        Ok(QueryResponse {
            record_ids: matched.into_iter().take(request.limit).collect(),
            further_results,
        })
    }
}

impl AttributeCatalog for MemoryStore {
    fn attribute_id(&self, name: &str) -> Option<AttributeId> {
        self.catalog.get(&normalize_key(name)).copied()
    }
}

#[async_trait]
impl RefreshService for MemoryStore {
    async fn refresh(
        &self,
        target_id: &str,
        kind: TaskKind,
    ) -> std::result::Result<(), RefreshError> {
        let key = normalize_key(target_id);
        if !self.records.read().await.contains_key(&key) {
            return Err(RefreshError::target(target_id, "no such record"));
        }
        if kind.rebuilds_data() {
            *self.rebuilds.write().await.entry(key.clone()).or_insert(0) += 1;
        }
        *self.refreshes.write().await.entry(key).or_insert(0) += 1;
        Ok(())
    }
}
