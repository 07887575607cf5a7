//! Refresh dispatch: in-line refresh or submission to a task queue

pub mod dispatcher;
pub mod models;
pub mod queue;
pub mod traits;

#[cfg(test)]
pub(crate) mod mock;

pub use dispatcher::RefreshDispatcher;
pub use models::{
    DispatchMode, DispatchReport, QueueTask, RefreshTask, TaskKind, TaskOptions, TaskPayload,
};
pub use queue::{
    ChannelQueue, RefreshWorker, WorkerStats, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE_CAPACITY,
};
pub use traits::{RefreshError, RefreshService, TaskQueue};
