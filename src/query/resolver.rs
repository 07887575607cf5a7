//! Dependency resolver: turns dependency specs into concrete target records.
//!
//! Two modes:
//!
//! 1. **Spec mode**: each value of the tracked attribute is parsed into a
//!    [`QueryExpr`], rendered, and executed against the store.
//! 2. **Relation mode**: records that point at a subject through one of the
//!    configured relations are looked up, either one level deep
//!    ([`DependencyResolver::resolve_referrers`]) or breadth-first over the
//!    whole reverse-relation graph ([`DependencyResolver::resolve_transitive`]).
//!
//! Failures are isolated per spec value (or per relation lookup) and reported
//! in the returned [`Resolution`]; they never abort the remaining lookups.

use super::expr::{Condition, QueryBuildError, QueryExpr};
use crate::store::{QueryExecutor, QueryRequest, QueryResponse, DEFAULT_QUERY_LIMIT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// Value types
// ============================================================================

/// Raw values of the tracked attribute on a subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    values: Vec<String>,
}

impl DependencySpec {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered set of target record keys.
///
/// Iteration follows insertion order of first discovery, so dispatch order
/// is reproducible for a given sequence of query responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id`; returns false if it was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.seen.contains(&id) {
            return false;
        }
        self.seen.insert(id.clone());
        self.order.push(id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.order.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.order
    }

    /// Merge `other` in, keeping first-discovery order.
    pub fn merge(&mut self, other: TargetSet) {
        for id in other.order {
            self.insert(id);
        }
    }
}

impl<S: Into<String>> FromIterator<S> for TargetSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = TargetSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl<'a> IntoIterator for &'a TargetSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}

/// A spec value or relation lookup that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    /// The spec value or `relation::record` lookup that failed
    pub source: String,
    pub error: String,
}

/// Outcome of resolving one subject's dependencies
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub targets: TargetSet,
    /// At least one query hit the result cap
    pub truncated: bool,
    pub failures: Vec<ResolutionFailure>,
}

impl Resolution {
    pub fn merge(&mut self, other: Resolution) {
        self.targets.merge(other.targets);
        self.truncated |= other.truncated;
        self.failures.extend(other.failures);
    }

    fn fail(&mut self, source: impl Into<String>, error: impl ToString) {
        self.failures.push(ResolutionFailure {
            source: source.into(),
            error: error.to_string(),
        });
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves dependency specs and reverse relations through a [`QueryExecutor`].
#[derive(Clone)]
pub struct DependencyResolver {
    executor: Arc<dyn QueryExecutor>,
    separator: Option<char>,
    limit: usize,
}

impl DependencyResolver {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            executor,
            separator: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    /// Multi-value list separator used by the host when joining values.
    pub fn with_separator(mut self, separator: Option<char>) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Parse one raw spec value into a query expression.
    pub fn build_query(&self, raw: &str) -> Result<QueryExpr, QueryBuildError> {
        QueryExpr::from_spec(raw, self.separator)
    }

    /// Resolve every value of `spec`, isolating failures per value.
    pub async fn resolve(&self, spec: &DependencySpec) -> Resolution {
        let mut resolution = Resolution::default();

        for raw in spec.values() {
            let expr = match self.build_query(raw) {
                Ok(expr) => expr,
                Err(e) => {
                    warn!("Skipping dependency spec {:?}: {}", raw, e);
                    resolution.fail(raw.as_str(), e);
                    continue;
                }
            };

            debug!(spec = %raw, query = %expr, "Resolving dependency spec");

            match self.run_query(&expr).await {
                Ok(response) => {
                    resolution.truncated |= response.further_results;
                    for id in response.record_ids {
                        resolution.targets.insert(id);
                    }
                }
                Err(e) => {
                    warn!("Failed to resolve dependency spec {:?}: {:#}", raw, e);
                    resolution.fail(raw.as_str(), format!("{:#}", e));
                }
            }
        }

        resolution
    }

    /// Records pointing at `id` through any of `relations`, one level deep.
    pub async fn resolve_referrers(&self, id: &str, relations: &[String]) -> Resolution {
        let mut resolution = Resolution::default();
        for relation in relations {
            if let Some(ids) = self.referrers(id, relation, &mut resolution).await {
                for found in ids {
                    resolution.targets.insert(found);
                }
            }
        }
        resolution
    }

    /// Breadth-first expansion of the reverse-relation graph starting at `start_id`.
    ///
    /// Every record reachable through `relations` is returned exactly once, in
    /// discovery order. `visited` starts empty, so the start record itself is
    /// included when a cycle leads back to it.
    pub async fn resolve_transitive(&self, start_id: &str, relations: &[String]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([start_id.to_string()]);

        while let Some(current) = queue.pop_front() {
            for relation in relations {
                let Some(ids) = self.referrers(&current, relation, &mut resolution).await else {
                    continue;
                };
                for found in ids {
                    if visited.insert(found.clone()) {
                        debug!("Dependency found: {} (via {} of {})", found, relation, current);
                        resolution.targets.insert(found.clone());
                        queue.push_back(found);
                    }
                }
            }
        }

        debug!(
            start = %start_id,
            found = resolution.targets.len(),
            "Transitive resolution complete"
        );
        resolution
    }

    /// `[[relation::id]]` lookup; failures are recorded and yield `None`.
    async fn referrers(
        &self,
        id: &str,
        relation: &str,
        resolution: &mut Resolution,
    ) -> Option<Vec<String>> {
        let source = format!("{}::{}", relation, id);
        let condition = match Condition::property(relation, id) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping relation lookup {}: {}", source, e);
                resolution.fail(source, e);
                return None;
            }
        };
        match self.run_query(&QueryExpr::from(condition)).await {
            Ok(response) => {
                resolution.truncated |= response.further_results;
                Some(response.record_ids)
            }
            Err(e) => {
                warn!("Relation lookup {} failed: {:#}", source, e);
                resolution.fail(source, format!("{:#}", e));
                None
            }
        }
    }

    async fn run_query(&self, expr: &QueryExpr) -> Result<QueryResponse> {
        let request = QueryRequest::new(expr.to_string(), self.limit);
        let mut response = self
            .executor
            .execute(&request)
            .await
            .with_context(|| format!("Query {} failed", request.expression))?;

        if response.record_ids.len() > self.limit {
            response.record_ids.truncate(self.limit);
            response.further_results = true;
        }
        if response.further_results {
            warn!(
                "Query {} hit the result cap of {}; remaining dependents are not refreshed",
                request.expression, self.limit
            );
        }
        Ok(response)
    }
}
