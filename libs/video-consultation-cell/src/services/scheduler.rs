// libs/video-consultation-cell/src/services/scheduler.rs
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::services::lock;

/// Background timers owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Heartbeat,
    QualitySampling,
    ReconnectionBackoff,
}

/// Cancellable tasks keyed by kind. At most one task per kind is live;
/// scheduling a kind again aborts its predecessor.
#[derive(Debug, Default)]
pub struct ScheduledTasks {
    tasks: Mutex<HashMap<TaskKind, JoinHandle<()>>>,
}

impl ScheduledTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, kind: TaskKind, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Some(previous) = lock(&self.tasks).insert(kind, handle) {
            previous.abort();
        }
        debug!("Scheduled {:?} task", kind);
    }

    pub fn cancel(&self, kind: TaskKind) -> bool {
        match lock(&self.tasks).remove(&kind) {
            Some(handle) => {
                handle.abort();
                debug!("Cancelled {:?} task", kind);
                true
            }
            None => false,
        }
    }

    /// Drops the bookkeeping for a task that is finishing on its own.
    /// Used by a task to deregister itself without aborting its own future.
    pub fn release(&self, kind: TaskKind) {
        lock(&self.tasks).remove(&kind);
    }

    /// Aborts every live task and returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(TaskKind, JoinHandle<()>)> = lock(&self.tasks).drain().collect();
        let count = drained.len();
        for (kind, handle) in drained {
            handle.abort();
            debug!("Cancelled {:?} task", kind);
        }
        count
    }

    pub fn is_scheduled(&self, kind: TaskKind) -> bool {
        lock(&self.tasks)
            .get(&kind)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn active_kinds(&self) -> Vec<TaskKind> {
        lock(&self.tasks)
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(kind, _)| *kind)
            .collect()
    }
}
