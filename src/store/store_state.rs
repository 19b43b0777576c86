use crate::messaging::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of the processing queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,

    /// Pending tasks claimable right now.
    pub due: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub oldest_due_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Draining,
    Offline,
}

/// An ephemeral worker identity, registered while it is claiming tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub worker_id: WorkerId,
    pub function_name: String,
    pub status: WorkerStatus,
    pub max_concurrent_tasks: usize,
    pub current_task_count: usize,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInstance {
    pub fn new(function_name: &str, max_concurrent_tasks: usize, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: WorkerId::generate(function_name),
            function_name: function_name.to_owned(),
            status: WorkerStatus::Active,
            max_concurrent_tasks,
            current_task_count: 0,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// The worker as seen with a liveness `cutoff`: offline when its last heartbeat is older.
    pub fn seen_since(mut self, cutoff: DateTime<Utc>) -> Self {
        if self.last_heartbeat < cutoff {
            self.status = WorkerStatus::Offline;
        }
        self
    }
}
