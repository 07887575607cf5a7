//! Trait abstractions for the refresh and task queue collaborators

use super::models::{QueueTask, TaskKind};
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by a [`RefreshService`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// This target could not be refreshed; other targets may still succeed
    #[error("refresh of {target} failed: {reason}")]
    Target { target: String, reason: String },

    /// The refresh collaborator itself is unusable; further calls are pointless
    #[error("refresh service unavailable: {0}")]
    Unavailable(String),
}

impl RefreshError {
    pub fn target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Target {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Performs the actual refresh (re-render / re-index) of a record.
///
/// `kind` selects what is recomputed. Implementations must be idempotent:
/// refreshing a target twice leaves it in the same state as refreshing it
/// once.
#[async_trait]
pub trait RefreshService: Send + Sync {
    async fn refresh(
        &self,
        target_id: &str,
        kind: TaskKind,
    ) -> std::result::Result<(), RefreshError>;
}

/// Asynchronous task queue accepting refresh tasks.
///
/// Submission is fire-and-forget: `Ok` means the queue accepted the tasks,
/// not that they ran. Delivery is at-least-once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Whether one task may carry several targets
    fn supports_batch(&self) -> bool {
        false
    }

    async fn submit(&self, tasks: Vec<QueueTask>) -> Result<()>;
}
