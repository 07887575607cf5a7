//! In-memory mock implementation of QueryExecutor for resolver and engine tests.

use super::traits::{AttributeCatalog, QueryExecutor, QueryRequest, QueryResponse};
use crate::notification::AttributeId;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Mock query executor returning canned responses keyed by rendered expression.
///
/// Unknown expressions yield an empty result. Every request is recorded so
/// tests can assert on what was (or was not) asked.
#[derive(Default)]
pub struct MockQueryExecutor {
    responses: RwLock<HashMap<String, Vec<String>>>,
    rejected: RwLock<HashSet<String>>,
    pub calls: RwLock<Vec<QueryRequest>>,
    attribute_ids: HashMap<String, AttributeId>,
}

impl MockQueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the records returned for `expression`.
    pub async fn respond(&self, expression: &str, ids: &[&str]) {
        self.responses.write().await.insert(
            expression.to_string(),
            ids.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Make the store reject `expression`.
    pub async fn reject(&self, expression: &str) {
        self.rejected.write().await.insert(expression.to_string());
    }

    pub fn with_attribute(mut self, name: &str, id: AttributeId) -> Self {
        self.attribute_ids.insert(name.to_string(), id);
        self
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn expressions(&self) -> Vec<String> {
        self.calls
            .read()
            .await
            .iter()
            .map(|r| r.expression.clone())
            .collect()
    }
}

#[async_trait]
impl QueryExecutor for MockQueryExecutor {
    async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.calls.write().await.push(request.clone());
        if self.rejected.read().await.contains(&request.expression) {
            bail!("query rejected by store: {}", request.expression);
        }
        let ids = self
            .responses
            .read()
            .await
            .get(&request.expression)
            .cloned()
            .unwrap_or_default();
        let further_results = ids.len() > request.limit;
        Ok(QueryResponse {
            record_ids: ids.into_iter().take(request.limit).collect(),
            further_results,
        })
    }
}

impl AttributeCatalog for MockQueryExecutor {
    fn attribute_id(&self, name: &str) -> Option<AttributeId> {
        self.attribute_ids.get(name).copied()
    }
}
