//! Trait abstraction for the semantic data store the engine reads from
//!
//! The engine never talks to a concrete store: it issues rendered queries
//! through [`QueryExecutor`] and resolves configured attribute names through
//! [`AttributeCatalog`]. `MemoryStore` implements both for the CLI and tests.

use crate::notification::AttributeId;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default cap on the number of records a single query may return
pub const DEFAULT_QUERY_LIMIT: usize = 10_000;

/// Query execution request handed to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Query in the store's rendered syntax (`[[A]] OR [[B]]`)
    pub expression: String,
    pub limit: usize,
}

impl QueryRequest {
    pub fn new(expression: impl Into<String>, limit: usize) -> Self {
        Self {
            expression: expression.into(),
            limit,
        }
    }
}

/// Matched record keys, in the order the store returned them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub record_ids: Vec<String>,
    /// Set when more records matched than `limit` allowed
    #[serde(default)]
    pub further_results: bool,
}

impl QueryResponse {
    pub fn new<I, S>(record_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            record_ids: record_ids.into_iter().map(Into::into).collect(),
            further_results: false,
        }
    }
}

/// Query execution capability of the store.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a query and return at most `request.limit` record keys.
    ///
    /// A rejected expression is reported as an error; the caller treats it
    /// as a failure of that one dependency spec value.
    async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse>;
}

/// Maps symbolic attribute names to the numeric ids used in diff tables.
pub trait AttributeCatalog: Send + Sync {
    fn attribute_id(&self, name: &str) -> Option<AttributeId>;
}
