//! Refresh dispatcher: turns resolved targets into refresh work.
//!
//! - **Immediate**: each target is refreshed in-line, in `TargetSet` order.
//!   A failed target is logged and skipped; only an unavailable refresh
//!   service aborts the call.
//! - **Queued**: one task per target (or one batch task when the queue
//!   accepts batches) is submitted in a single call. Submission failure is
//!   returned to the caller; there is no local retry.

use super::models::{DispatchMode, DispatchReport, QueueTask, RefreshTask, TaskKind, TaskOptions};
use super::traits::{RefreshError, RefreshService, TaskQueue};
use crate::query::TargetSet;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dispatches refresh work to the refresh service or the task queue.
#[derive(Clone)]
pub struct RefreshDispatcher {
    refresher: Arc<dyn RefreshService>,
    queue: Arc<dyn TaskQueue>,
    task_kind: TaskKind,
    batch: bool,
}

impl RefreshDispatcher {
    pub fn new(refresher: Arc<dyn RefreshService>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            refresher,
            queue,
            task_kind: TaskKind::default(),
            batch: false,
        }
    }

    pub fn with_task_kind(mut self, kind: TaskKind) -> Self {
        self.task_kind = kind;
        self
    }

    /// Prefer one batch task over one task per target when the queue allows it.
    pub fn with_batching(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    /// Dispatch `targets` in `mode`. `origin` is the subject that caused the refresh.
    pub async fn dispatch(
        &self,
        targets: &TargetSet,
        mode: DispatchMode,
        origin: Option<&str>,
    ) -> Result<DispatchReport> {
        if targets.is_empty() {
            debug!("No dependent records to refresh");
            return Ok(DispatchReport::empty(mode));
        }

        match mode {
            DispatchMode::Immediate => self.refresh_now(targets).await,
            DispatchMode::Queued => self.enqueue(targets, origin).await,
        }
    }

    async fn refresh_now(&self, targets: &TargetSet) -> Result<DispatchReport> {
        let mut report = DispatchReport::empty(DispatchMode::Immediate);

        for target in targets {
            debug!("[Refresh] {}", target);
            report.tasks.push(RefreshTask {
                target_id: target.clone(),
                mode: DispatchMode::Immediate,
            });

            match self.refresher.refresh(target, self.task_kind).await {
                Ok(()) => report.refreshed.push(target.clone()),
                Err(RefreshError::Unavailable(reason)) => {
                    return Err(RefreshError::Unavailable(reason)).with_context(|| {
                        format!(
                            "Aborting refresh after {} of {} targets",
                            report.refreshed.len(),
                            targets.len()
                        )
                    });
                }
                Err(e) => {
                    warn!("Failed to refresh {}: {}", target, e);
                    report.failed.push((target.clone(), e.to_string()));
                }
            }
        }

        info!(
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            "Immediate refresh complete"
        );
        Ok(report)
    }

    async fn enqueue(&self, targets: &TargetSet, origin: Option<&str>) -> Result<DispatchReport> {
        let mut report = DispatchReport::empty(DispatchMode::Queued);
        let options = TaskOptions {
            origin: origin.map(str::to_string),
            attempt: 0,
        };

        report.tasks = targets
            .iter()
            .map(|t| RefreshTask {
                target_id: t.clone(),
                mode: DispatchMode::Queued,
            })
            .collect();

        let tasks: Vec<QueueTask> = if self.batch && self.queue.supports_batch() {
            vec![QueueTask::batch(
                self.task_kind,
                targets.as_slice().to_vec(),
                options,
            )]
        } else {
            targets
                .iter()
                .map(|t| QueueTask::single(self.task_kind, t.clone(), options.clone()))
                .collect()
        };

        for target in targets {
            debug!("[Refresh task] {}", target);
        }

        let count = tasks.len();
        self.queue
            .submit(tasks)
            .await
            .with_context(|| format!("Failed to submit {} refresh tasks", count))?;

        report.submitted_tasks = count;
        report.submitted_targets = targets.len();
        info!(
            tasks = count,
            targets = targets.len(),
            "Refresh tasks submitted"
        );
        Ok(report)
    }
}
