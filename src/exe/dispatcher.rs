//!
//! Claiming and executing queue tasks.
//!
//! A dispatcher claims tasks on behalf of a worker and runs them through the handler registered
//! for their task type. Every store write after the claim carries the worker's ID, so a worker
//! that lost its claim (its lease expired and the task moved on) cannot overwrite the task: its
//! outcome is discarded instead.
//!

use crate::audit::{AuditEntry, AuditEvent, AuditLevel, AuditLog};
use crate::clock::Clock;
use crate::exe::HandlerRegistry;
use crate::messaging::{QueueTask, TaskId, WorkerId};
use crate::notifications::{NotificationCenter, NotificationKind};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{QueueStore, StoreError};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Seconds a claim stays valid before the task may be recovered from its worker.
pub const DEFAULT_LEASE_SECS: i64 = 600;

/// What became of a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed { task_id: TaskId },

    /// The attempt failed and the task is back in the queue.
    Retrying { task_id: TaskId, retry_count: u32, scheduled_at: DateTime<Utc> },

    /// The attempt failed and the task won't be tried again.
    Failed { task_id: TaskId, retry_count: u32 },

    /// The worker no longer owned the task when recording the outcome.
    Discarded { task_id: TaskId },
}

impl DispatchOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            DispatchOutcome::Completed { task_id }
            | DispatchOutcome::Retrying { task_id, .. }
            | DispatchOutcome::Failed { task_id, .. }
            | DispatchOutcome::Discarded { task_id } => *task_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }
}

#[derive(Debug)]
pub struct Dispatcher<S> {
    store: S,
    handlers: HandlerRegistry,
    retry: RetryPolicy,
    lease: Duration,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    notifications: Arc<NotificationCenter>,
}

impl<S> Dispatcher<S>
where
    S: QueueStore + Send + Sync,
{
    pub fn new(
        store: S,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        notifications: Arc<NotificationCenter>,
    ) -> Self {
        Self {
            store,
            handlers,
            retry: RetryPolicy::default(),
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
            clock,
            audit,
            notifications,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Claim the next due task for `worker_id`, if any.
    pub async fn claim(&self, worker_id: &WorkerId) -> Result<Option<QueueTask>, anyhow::Error> {
        let now = self.clock.now();
        let task = self
            .store
            .claim_next(worker_id.clone(), now, self.lease)
            .await
            .context("claiming next task")?;

        if let Some(task) = &task {
            debug!(task_id = task.id, worker_id, task_type = task.task_type.as_str(); "Task claimed");
        }
        Ok(task)
    }

    /// Claim one task and execute it.
    ///
    /// # Returns
    ///
    /// `None` when there was nothing to claim.
    ///
    pub async fn dispatch_once(&self, worker_id: &WorkerId) -> Result<Option<DispatchOutcome>, anyhow::Error> {
        match self.claim(worker_id).await? {
            Some(task) => Ok(Some(self.execute(task, worker_id).await?)),
            None => Ok(None),
        }
    }

    /// Run a claimed task through its handler and record the outcome.
    ///
    /// Handler errors and panics are recorded on the task, they never surface here. An error is
    /// only returned when the outcome itself couldn't be stored.
    ///
    pub async fn execute(&self, task: QueueTask, worker_id: &WorkerId) -> Result<DispatchOutcome, anyhow::Error> {
        let payload = match task.payload() {
            Ok(payload) => payload,
            Err(e) => return self.record_failure(&task, worker_id, &e, false).await,
        };
        let Some(handler) = self.handlers.get(task.task_type) else {
            let e = anyhow!("no handler registered for {} tasks", task.task_type);
            return self.record_failure(&task, worker_id, &e, false).await;
        };

        let result = match AssertUnwindSafe(handler.handle(&task, payload)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
        };

        match result {
            Ok(value) => self.record_success(&task, worker_id, value).await,
            Err(e) => self.record_failure(&task, worker_id, &e, true).await,
        }
    }

    async fn record_success(
        &self,
        task: &QueueTask,
        worker_id: &WorkerId,
        value: serde_json::Value,
    ) -> Result<DispatchOutcome, anyhow::Error> {
        let now = self.clock.now();
        let stored = self.store.complete(task.id, worker_id.clone(), value, now).await;
        if fenced(stored, task.id, worker_id).context("completing task")?.is_none() {
            return Ok(DispatchOutcome::Discarded { task_id: task.id });
        }

        self.audit.record(
            AuditEntry::new(
                now,
                AuditLevel::Info,
                AuditEvent::TaskCompleted,
                format!("{} task completed after {} retries", task.task_type, task.retry_count),
            )
            .task(task.id)
            .worker(worker_id),
        );
        Ok(DispatchOutcome::Completed { task_id: task.id })
    }

    /// Record a failed attempt of a claimed task.
    ///
    /// # Arguments
    ///
    /// `task` - The task as it was claimed.
    /// `worker_id` - The worker holding the claim.
    /// `error` - Why the attempt failed. Stored on the task.
    /// `retryable` - Whether the retry policy applies. A task failing for good is failed at once.
    ///
    pub async fn record_failure(
        &self,
        task: &QueueTask,
        worker_id: &WorkerId,
        error: &anyhow::Error,
        retryable: bool,
    ) -> Result<DispatchOutcome, anyhow::Error> {
        let now = self.clock.now();
        let message = format!("{error:#}");
        let decision = if retryable {
            self.retry.decide(task.retry_count, task.max_retries, now)
        } else {
            RetryDecision::Exhausted { retry_count: task.retry_count.saturating_add(1) }
        };

        match decision {
            RetryDecision::Retry { retry_count, scheduled_at } => {
                let stored = self
                    .store
                    .reschedule(task.id, worker_id.clone(), retry_count, message.clone(), scheduled_at)
                    .await;
                if fenced(stored, task.id, worker_id).context("rescheduling task")?.is_none() {
                    return Ok(DispatchOutcome::Discarded { task_id: task.id });
                }

                self.audit.record(
                    AuditEntry::new(
                        now,
                        AuditLevel::Warning,
                        AuditEvent::TaskRetryScheduled,
                        format!("Attempt {retry_count} failed, retrying at {scheduled_at}: {message}"),
                    )
                    .task(task.id)
                    .worker(worker_id),
                );
                Ok(DispatchOutcome::Retrying { task_id: task.id, retry_count, scheduled_at })
            }

            RetryDecision::Exhausted { retry_count } => {
                let stored = self.store.fail(task.id, worker_id.clone(), retry_count, message.clone(), now).await;
                if fenced(stored, task.id, worker_id).context("failing task")?.is_none() {
                    return Ok(DispatchOutcome::Discarded { task_id: task.id });
                }

                self.audit.record(
                    AuditEntry::new(
                        now,
                        AuditLevel::Critical,
                        AuditEvent::TaskFailed,
                        format!("{} task failed after {retry_count} attempt(s): {message}", task.task_type),
                    )
                    .task(task.id)
                    .worker(worker_id),
                );
                self.notifications.publish(
                    NotificationKind::Destructive,
                    "Task failed",
                    format!("A {} task failed permanently: {message}", task.task_type),
                    task.client_id.clone(),
                    now,
                );
                Ok(DispatchOutcome::Failed { task_id: task.id, retry_count })
            }
        }
    }

    /// Treat processing tasks whose lease ran out as failed attempts.
    pub async fn recover_expired_leases(&self) -> Result<Vec<DispatchOutcome>, anyhow::Error> {
        let now = self.clock.now();
        let expired = self.store.expired_leases(now).await.context("listing expired leases")?;

        let mut outcomes = Vec::with_capacity(expired.len());
        for task in expired {
            let Some(owner) = task.worker_id.clone() else {
                continue;
            };

            self.audit.record(
                AuditEntry::new(now, AuditLevel::Warning, AuditEvent::LeaseExpired, "Lease expired")
                    .task(task.id)
                    .worker(&owner),
            );
            let outcome = self
                .record_failure(&task, &owner, &anyhow!("lease expired"), true)
                .await
                .with_context(|| format!("recovering task {}", task.id))?;
            outcomes.push(outcome);
        }

        if !outcomes.is_empty() {
            info!(count = outcomes.len(); "Recovered tasks with expired leases");
        }
        Ok(outcomes)
    }
}

/// Turn a rejected write by a worker that no longer owns the task into `None`.
fn fenced<T>(result: Result<T, StoreError>, task_id: TaskId, worker_id: &WorkerId) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ (StoreError::NotOwner { .. } | StoreError::InvalidTransition { .. })) => {
            warn!(task_id, worker_id, e:%; "Discarding outcome of a task no longer owned");
            Ok(None)
        }
        Err(e) => {
            error!(task_id, worker_id, e:%; "Storing task outcome failed");
            Err(e)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
