//! Refresh task models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// How resolved targets are refreshed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Refresh each target in-line, before returning to the write path
    #[default]
    Immediate,
    /// Submit refresh tasks to the task queue and return
    Queued,
}

/// What the queue worker does for a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Save the target's current content again so derived data is recomputed
    #[default]
    NullEdit,
    /// Rebuild the target's semantic data without touching its content
    RebuildData,
    /// Rebuild semantic data, then save a null revision
    RebuildAndNullEdit,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::NullEdit => "null_edit",
            TaskKind::RebuildData => "rebuild_data",
            TaskKind::RebuildAndNullEdit => "rebuild_and_null_edit",
        }
    }

    /// Whether the target's semantic data is rebuilt from its content
    pub fn rebuilds_data(&self) -> bool {
        matches!(self, TaskKind::RebuildData | TaskKind::RebuildAndNullEdit)
    }

    /// Whether a null revision of the target is saved
    pub fn saves_revision(&self) -> bool {
        matches!(self, TaskKind::NullEdit | TaskKind::RebuildAndNullEdit)
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "null_edit" => Ok(TaskKind::NullEdit),
            "rebuild_data" => Ok(TaskKind::RebuildData),
            "rebuild_and_null_edit" => Ok(TaskKind::RebuildAndNullEdit),
            other => Err(anyhow::anyhow!("unknown task kind: {}", other)),
        }
    }
}

/// One refresh decision made by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTask {
    pub target_id: String,
    pub mode: DispatchMode,
}

/// Targets carried by a queued task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Single { target_id: String },
    Batch { target_ids: Vec<String> },
}

/// Metadata attached to a queued task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Subject whose change caused the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Delivery attempt, starting at 0
    #[serde(default)]
    pub attempt: u32,
}

/// Task descriptor submitted to the task queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    #[serde(default)]
    pub options: TaskOptions,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueTask {
    pub fn new(kind: TaskKind, payload: TaskPayload, options: TaskOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            options,
            enqueued_at: Utc::now(),
        }
    }

    pub fn single(kind: TaskKind, target_id: impl Into<String>, options: TaskOptions) -> Self {
        Self::new(
            kind,
            TaskPayload::Single {
                target_id: target_id.into(),
            },
            options,
        )
    }

    pub fn batch(kind: TaskKind, target_ids: Vec<String>, options: TaskOptions) -> Self {
        Self::new(kind, TaskPayload::Batch { target_ids }, options)
    }

    pub fn target_ids(&self) -> Vec<&str> {
        match &self.payload {
            TaskPayload::Single { target_id } => vec![target_id.as_str()],
            TaskPayload::Batch { target_ids } => target_ids.iter().map(String::as_str).collect(),
        }
    }

    /// A copy of this task for one target, scheduled for the next attempt.
    pub fn retry_for(&self, target_id: &str) -> Self {
        Self::single(
            self.kind,
            target_id,
            TaskOptions {
                origin: self.options.origin.clone(),
                attempt: self.options.attempt + 1,
            },
        )
    }
}

/// What a dispatch call did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    pub mode: DispatchMode,
    /// Targets refreshed in-line
    pub refreshed: Vec<String>,
    /// Targets whose in-line refresh failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Number of task descriptors submitted to the queue
    pub submitted_tasks: usize,
    /// Number of targets covered by the submitted tasks
    pub submitted_targets: usize,
    /// Per-target decisions, in dispatch order
    pub tasks: Vec<RefreshTask>,
}

impl DispatchReport {
    pub fn empty(mode: DispatchMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }
}
