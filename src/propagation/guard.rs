//! Re-entrancy guard for propagation.
//!
//! A refresh can itself produce a change notification for the subject that
//! triggered it. The guard counts how often each subject has entered
//! propagation within one unit of work and suppresses it past a threshold.
//! Counters live on a [`PropagationContext`], never in shared state.

use std::collections::HashMap;
use uuid::Uuid;

/// Number of propagations allowed per subject within one context
pub const DEFAULT_TRAVERSAL_THRESHOLD: u32 = 2;

/// Per-context count of propagation attempts, keyed by subject
#[derive(Debug, Clone, Default)]
pub struct TraversalCounter {
    counts: HashMap<String, u32>,
}

impl TraversalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more attempt for `subject` and return the new count.
    pub fn record(&mut self, subject: &str) -> u32 {
        let count = self.counts.entry(subject.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn count(&self, subject: &str) -> u32 {
        self.counts.get(subject).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Outcome of consulting the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Allow { count: u32 },
    Suppress { count: u32 },
}

impl GuardDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, GuardDecision::Allow { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TraversalGuard {
    threshold: u32,
}

impl Default for TraversalGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TRAVERSAL_THRESHOLD)
    }
}

impl TraversalGuard {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count this attempt and decide whether it may proceed.
    pub fn check(&self, subject: &str, counter: &mut TraversalCounter) -> GuardDecision {
        let count = counter.record(subject);
        if count > self.threshold {
            tracing::debug!(subject = %subject, count, "Already traversed");
            GuardDecision::Suppress { count }
        } else {
            GuardDecision::Allow { count }
        }
    }

    pub fn allow(&self, subject: &str, counter: &mut TraversalCounter) -> bool {
        self.check(subject, counter).allowed()
    }
}

/// State for one logical unit of work (one request, one batch run).
///
/// Create one per unit and pass it by `&mut` to every propagation call that
/// belongs to it; drop it when the unit ends.
#[derive(Debug, Clone)]
pub struct PropagationContext {
    pub id: Uuid,
    pub counter: TraversalCounter,
}

impl Default for PropagationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            counter: TraversalCounter::new(),
        }
    }
}
