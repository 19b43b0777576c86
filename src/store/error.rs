use crate::messaging::{TaskId, TaskStatus, WorkerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The task is claimed by another worker, or by nobody. Used to fence off stale workers.
    #[error("task {task_id} is not owned by worker {worker_id}")]
    NotOwner { task_id: TaskId, worker_id: WorkerId },

    #[error("task {task_id} cannot leave status {from:?}")]
    InvalidTransition { task_id: TaskId, from: TaskStatus },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found<I: ToString>(entity: &'static str, id: I) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}
