//! Test helper factories and mock propagator builders
//!
//! Provides convenience functions for creating notifications with sensible
//! defaults, and a harness wiring a `Propagator` to in-memory mocks.
#![allow(dead_code)]

use crate::dispatch::mock::{MockRefreshService, MockTaskQueue};
use crate::notification::{AttributeDescriptor, ChangeEntry, ChangeNotification};
use crate::propagation::{PropagationSettings, Propagator};
use crate::store::mock::MockQueryExecutor;
use std::sync::Arc;

// ============================================================================
// Mock propagator builders
// ============================================================================

/// A propagator plus handles on every mock it talks to
pub struct Harness {
    pub executor: Arc<MockQueryExecutor>,
    pub refresher: Arc<MockRefreshService>,
    pub queue: Arc<MockTaskQueue>,
    pub propagator: Propagator,
}

/// Create a propagator backed by empty mocks
pub fn harness(settings: PropagationSettings) -> Harness {
    harness_with(settings, MockTaskQueue::new())
}

/// Create a propagator backed by empty mocks and the given queue
pub fn harness_with(settings: PropagationSettings, queue: MockTaskQueue) -> Harness {
    let executor = Arc::new(MockQueryExecutor::new());
    let refresher = Arc::new(MockRefreshService::new());
    let queue = Arc::new(queue);
    let propagator = Propagator::new(
        settings,
        executor.clone(),
        refresher.clone(),
        queue.clone(),
    );
    Harness {
        executor,
        refresher,
        queue,
        propagator,
    }
}

// ============================================================================
// Notification factories
// ============================================================================

/// Notification for a write of `subject` that changed a semantic value and
/// carries `spec` as its dependency spec
pub fn changed(subject: &str, spec: &[&str]) -> ChangeNotification {
    ChangeNotification::new(subject)
        .with_record_id(1)
        .with_attribute(
            "Semantic Dependency",
            AttributeDescriptor::text(spec.iter().copied()),
        )
        .with_inserted("smw_di_blob", ChangeEntry::new(1, 7, "changed"))
}
