//! In-process task queue and the worker that drains it.
//!
//! `ChannelQueue` is the `TaskQueue` used when no external job system is
//! configured. Submission never blocks and is all-or-nothing: capacity for
//! the whole submission is reserved first, and a full or closed channel is an
//! error returned to the dispatcher with nothing enqueued. `RefreshWorker` consumes tasks sequentially on
//! a background tokio task and re-runs failed targets until they succeed or
//! run out of attempts. Refresh is idempotent, so a target delivered twice
//! costs a redundant refresh and nothing more.

use super::models::QueueTask;
use super::traits::{RefreshService, TaskQueue};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// `TaskQueue` backed by a bounded tokio mpsc channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<QueueTask>,
    batch: bool,
}

impl ChannelQueue {
    /// Create the queue and the receiving half to hand to a [`RefreshWorker`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueueTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, batch: true }, rx)
    }

    pub fn without_batching(mut self) -> Self {
        self.batch = false;
        self
    }
}

#[async_trait]
impl TaskQueue for ChannelQueue {
    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn submit(&self, tasks: Vec<QueueTask>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let total = tasks.len();
        let permits = self
            .tx
            .try_reserve_many(total)
            .map_err(|e| anyhow!("refresh queue refused {} task(s): {}", total, e))?;
        for (permit, task) in permits.zip(tasks) {
            permit.send(task);
        }
        Ok(())
    }
}

/// Counters reported when the worker stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed_tasks: usize,
    pub refreshed: usize,
    pub retried: usize,
    pub abandoned: usize,
}

/// Sequential consumer of refresh tasks.
pub struct RefreshWorker {
    refresher: Arc<dyn RefreshService>,
    max_attempts: u32,
}

impl RefreshWorker {
    pub fn new(refresher: Arc<dyn RefreshService>, max_attempts: u32) -> Self {
        Self {
            refresher,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Spawn the worker loop. It ends once every sender is dropped and all
    /// pending retries have run.
    pub fn spawn(self, rx: mpsc::Receiver<QueueTask>) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.run_loop(rx))
    }

    async fn run_loop(self, mut rx: mpsc::Receiver<QueueTask>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let mut pending: VecDeque<QueueTask> = VecDeque::new();

        loop {
            let task = match pending.pop_front() {
                Some(task) => task,
                None => match rx.recv().await {
                    Some(task) => task,
                    None => break,
                },
            };
            stats.processed_tasks += 1;
            self.process(task, &mut pending, &mut stats).await;
        }

        tracing::info!(
            processed = stats.processed_tasks,
            refreshed = stats.refreshed,
            retried = stats.retried,
            abandoned = stats.abandoned,
            "Refresh worker stopped"
        );
        stats
    }

    async fn process(
        &self,
        task: QueueTask,
        pending: &mut VecDeque<QueueTask>,
        stats: &mut WorkerStats,
    ) {
        tracing::debug!(
            task_id = %task.id,
            kind = ?task.kind,
            attempt = task.options.attempt,
            "Running refresh task"
        );

        for target in task.target_ids() {
            let err = match self.refresher.refresh(target, task.kind).await {
                Ok(()) => {
                    stats.refreshed += 1;
                    continue;
                }
                Err(e) => e,
            };

            if task.options.attempt + 1 < self.max_attempts {
                tracing::warn!(
                    "Refresh of {} failed (attempt {}), retrying: {}",
                    target,
                    task.options.attempt + 1,
                    err
                );
                stats.retried += 1;
                pending.push_back(task.retry_for(target));
            } else {
                tracing::warn!(
                    "Giving up on {} after {} attempts: {}",
                    target,
                    self.max_attempts,
                    err
                );
                stats.abandoned += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::mock::MockRefreshService;
    use crate::dispatch::models::{TaskKind, TaskOptions};

    fn single(target: &str) -> QueueTask {
        QueueTask::single(TaskKind::NullEdit, target, TaskOptions::default())
    }

    #[tokio::test]
    async fn test_worker_drains_submitted_tasks() {
        let refresher = Arc::new(MockRefreshService::new());
        let (queue, rx) = ChannelQueue::new(16);
        let handle = RefreshWorker::new(refresher.clone(), 3).spawn(rx);

        queue
            .submit(vec![
                single("A"),
                QueueTask::batch(
                    TaskKind::RebuildData,
                    vec!["B".into(), "C".into()],
                    TaskOptions::default(),
                ),
            ])
            .await
            .unwrap();
        drop(queue);

        let stats = handle.await.unwrap();
        assert_eq!(stats.processed_tasks, 2);
        assert_eq!(stats.refreshed, 3);
        assert_eq!(refresher.refreshed().await, vec!["A", "B", "C"]);
        assert_eq!(
            refresher.kinds().await,
            vec![TaskKind::NullEdit, TaskKind::RebuildData, TaskKind::RebuildData]
        );
    }

    #[tokio::test]
    async fn test_worker_retries_then_abandons() {
        let refresher = Arc::new(MockRefreshService::new());
        refresher.fail_on("A").await;
        let (queue, rx) = ChannelQueue::new(16);
        let handle = RefreshWorker::new(refresher.clone(), 3).spawn(rx);

        queue.submit(vec![single("A"), single("B")]).await.unwrap();
        drop(queue);

        let stats = handle.await.unwrap();
        assert_eq!(stats.refreshed, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.abandoned, 1);
        let calls = refresher.refreshed().await;
        assert_eq!(calls.iter().filter(|t| *t == "A").count(), 3);
        assert_eq!(calls.iter().filter(|t| *t == "B").count(), 1);
    }

    #[tokio::test]
    async fn test_retry_only_failed_batch_member() {
        let refresher = Arc::new(MockRefreshService::new());
        refresher.fail_on("B").await;
        let (queue, rx) = ChannelQueue::new(16);
        let handle = RefreshWorker::new(refresher.clone(), 2).spawn(rx);

        queue
            .submit(vec![QueueTask::batch(
                TaskKind::NullEdit,
                vec!["A".into(), "B".into()],
                TaskOptions::default(),
            )])
            .await
            .unwrap();
        drop(queue);

        let stats = handle.await.unwrap();
        assert_eq!(stats.processed_tasks, 2);
        assert_eq!(refresher.refreshed().await, vec!["A", "B", "B"]);
        assert_eq!(stats.abandoned, 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let (queue, _rx) = ChannelQueue::new(1);
        let result = queue.submit(vec![single("A"), single("B")]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_partial_fit_enqueues_nothing() {
        let (queue, mut rx) = ChannelQueue::new(2);
        let result = queue
            .submit(vec![single("A"), single("B"), single("C")])
            .await;
        assert!(result.is_err());
        assert!(rx.try_recv().is_err());

        // the rejected submission left the capacity untouched
        queue.submit(vec![single("D"), single("E")]).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().target_ids(), vec!["D"]);
        assert_eq!(rx.try_recv().unwrap().target_ids(), vec!["E"]);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_submission() {
        let (queue, rx) = ChannelQueue::new(4);
        drop(rx);
        assert!(queue.submit(vec![single("A")]).await.is_err());
    }

    #[test]
    fn test_batching_can_be_disabled() {
        let (queue, _rx) = ChannelQueue::new(4);
        assert!(queue.supports_batch());
        assert!(!queue.without_batching().supports_batch());
    }
}
