//! Mock refresh and queue collaborators for dispatcher and engine tests.

use super::models::{QueueTask, TaskKind};
use super::traits::{RefreshError, RefreshService, TaskQueue};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Records every refresh call; selected targets fail.
#[derive(Default)]
pub struct MockRefreshService {
    pub calls: RwLock<Vec<String>>,
    pub kinds: RwLock<Vec<TaskKind>>,
    failing: RwLock<HashSet<String>>,
    unavailable: AtomicBool,
}

impl MockRefreshService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_on(&self, target: &str) {
        self.failing.write().await.insert(target.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn refreshed(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }

    /// Task kind of every refresh call, in call order
    pub async fn kinds(&self) -> Vec<TaskKind> {
        self.kinds.read().await.clone()
    }
}

#[async_trait]
impl RefreshService for MockRefreshService {
    async fn refresh(
        &self,
        target_id: &str,
        kind: TaskKind,
    ) -> std::result::Result<(), RefreshError> {
        self.calls.write().await.push(target_id.to_string());
        self.kinds.write().await.push(kind);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RefreshError::Unavailable("mock offline".into()));
        }
        if self.failing.read().await.contains(target_id) {
            return Err(RefreshError::target(target_id, "mock failure"));
        }
        Ok(())
    }
}

/// Records every submission; can be told to reject them.
#[derive(Default)]
pub struct MockTaskQueue {
    pub submissions: RwLock<Vec<Vec<QueueTask>>>,
    batch: bool,
    rejecting: AtomicBool,
}

impl MockTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch() -> Self {
        Self {
            batch: true,
            ..Default::default()
        }
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub async fn submission_count(&self) -> usize {
        self.submissions.read().await.len()
    }

    pub async fn tasks(&self) -> Vec<QueueTask> {
        self.submissions
            .read()
            .await
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MockTaskQueue {
    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn submit(&self, tasks: Vec<QueueTask>) -> Result<()> {
        if self.rejecting.load(Ordering::SeqCst) {
            bail!("mock queue rejected {} tasks", tasks.len());
        }
        self.submissions.write().await.push(tasks);
        Ok(())
    }
}
