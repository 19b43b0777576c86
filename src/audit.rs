//!
//! Audit trail of queue and closing transitions.
//!
//! Entries are kept in a bounded ring buffer owned by the application context; once full, the
//! oldest entry is evicted. Every entry is also written to the log at a matching level.
//!

use crate::messaging::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    TaskEnqueued,
    TaskCompleted,
    TaskRetryScheduled,
    TaskFailed,
    LeaseExpired,
    WorkerRegistered,
    WorkerDeregistered,
    WorkersCleanedUp,
    BatchStarted,
    BatchFinished,
    ClosingInitialized,
    ClosingAdvanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub level: AuditLevel,
    pub event: AuditEvent,
    pub task_id: Option<TaskId>,
    pub worker_id: Option<WorkerId>,
    pub message: String,
}

impl AuditEntry {
    pub fn new<M: Into<String>>(at: DateTime<Utc>, level: AuditLevel, event: AuditEvent, message: M) -> Self {
        Self { at, level, event, task_id: None, worker_id: None, message: message.into() }
    }

    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn worker(mut self, worker_id: &WorkerId) -> Self {
        self.worker_id = Some(worker_id.clone());
        self
    }
}

#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn record(&self, entry: AuditEntry) {
        let event = format!("{:?}", entry.event);
        let task_id = entry.task_id.map(|id| id.to_string()).unwrap_or_default();
        match entry.level {
            AuditLevel::Info => info!(event, task_id; "{}", entry.message),
            AuditLevel::Warning => warn!(event, task_id; "{}", entry.message),
            AuditLevel::Critical => error!(event, task_id; "{}", entry.message),
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, event: AuditEvent) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().filter(|e| e.event == event).count()
    }
}
