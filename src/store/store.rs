use crate::clients::Client;
use crate::closing::{ChecklistItem, ClosingStatus, ClosingWithItems};
use crate::messaging::{ChecklistItemId, ClientId, ClosingId, NewTask, QueueTask, TaskId, WorkerId};
use crate::payments::Payment;
use crate::period::Period;
use crate::store::{QueueStats, StoreError, WorkerInstance, WorkerStatus};
use chrono::{DateTime, NaiveDate, Utc};
use std::future::Future;

/// The processing queue.
///
/// Implementations must make [`QueueStore::claim_next`] atomic: a pending task is handed to at
/// most one worker. Every write after the claim names the claiming worker and must be rejected
/// with [`StoreError::NotOwner`] when that worker no longer holds the task.
///
pub trait QueueStore {
    /// Insert a single task.
    fn enqueue(&self, task: NewTask, now: DateTime<Utc>)
        -> impl Future<Output = Result<QueueTask, StoreError>> + Send;

    /// Insert many tasks at once. Either all tasks are inserted or none.
    fn enqueue_batch(
        &self,
        tasks: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<TaskId>, StoreError>> + Send;

    /// Claim the most urgent due task for a worker.
    ///
    /// Candidates are pending tasks scheduled at or before `now` with retries left, ordered by
    /// priority then scheduled time. Pending tasks without retries left are failed on the way.
    ///
    /// # Returns
    ///
    /// The claimed task, now processing with its lease ending at `now + lease`, or `None` when
    /// nothing is due.
    ///
    fn claim_next(
        &self,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> impl Future<Output = Result<Option<QueueTask>, StoreError>> + Send;

    fn complete(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueueTask, StoreError>> + Send;

    /// Put a claimed task back in the queue after a failed attempt.
    fn reschedule(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        retry_count: u32,
        error: String,
        scheduled_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueueTask, StoreError>> + Send;

    /// Fail a claimed task for good.
    fn fail(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        retry_count: u32,
        error: String,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<QueueTask, StoreError>> + Send;

    fn get_task(&self, task_id: TaskId) -> impl Future<Output = Result<Option<QueueTask>, StoreError>> + Send;

    /// Processing tasks whose lease ended at or before `now`.
    fn expired_leases(&self, now: DateTime<Utc>) -> impl Future<Output = Result<Vec<QueueTask>, StoreError>> + Send;

    fn queue_stats(&self, now: DateTime<Utc>) -> impl Future<Output = Result<QueueStats, StoreError>> + Send;
}

/// Registry of workers.
pub trait WorkerStore {
    fn register_worker(&self, worker: WorkerInstance) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn heartbeat(
        &self,
        worker_id: WorkerId,
        current_task_count: usize,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_worker_status(&self, worker_id: WorkerId, status: WorkerStatus)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove a worker. Removing an unknown worker is not an error.
    fn deregister_worker(&self, worker_id: WorkerId) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn list_workers(&self) -> impl Future<Output = Result<Vec<WorkerInstance>, StoreError>> + Send;

    /// Remove workers whose last heartbeat is older than `cutoff`.
    ///
    /// # Returns
    ///
    /// The removed workers.
    ///
    fn cleanup_offline_workers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<WorkerInstance>, StoreError>> + Send;
}

/// Monthly closing records and their checklists.
pub trait ClosingStore {
    fn closings_for_period(&self, period: Period)
        -> impl Future<Output = Result<Vec<ClosingWithItems>, StoreError>> + Send;

    fn closing_for_client(
        &self,
        client_id: ClientId,
        period: Period,
    ) -> impl Future<Output = Result<Option<ClosingWithItems>, StoreError>> + Send;

    fn get_closing(&self, closing_id: ClosingId)
        -> impl Future<Output = Result<Option<ClosingWithItems>, StoreError>> + Send;

    /// Insert closings in bulk. Either all closings are inserted or none.
    fn insert_closings(&self, closings: Vec<ClosingStatus>) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert checklist items in bulk. Either all items are inserted or none.
    fn insert_checklist_items(&self, items: Vec<ChecklistItem>)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update_closing(&self, closing: ClosingStatus) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_checklist_item(&self, item_id: ChecklistItemId)
        -> impl Future<Output = Result<Option<ChecklistItem>, StoreError>> + Send;

    fn update_checklist_item(&self, item: ChecklistItem) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub trait ClientDirectory {
    fn active_clients(&self) -> impl Future<Output = Result<Vec<Client>, StoreError>> + Send;

    fn upsert_client(&self, client: Client) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub trait PaymentStore {
    /// Unpaid payments due strictly before `today`.
    fn overdue_payments(&self, today: NaiveDate) -> impl Future<Output = Result<Vec<Payment>, StoreError>> + Send;

    fn record_payment(&self, payment: Payment) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Everything the application needs from its backing store.
pub trait Store:
    QueueStore + WorkerStore + ClosingStore + ClientDirectory + PaymentStore + Clone + Send + Sync + 'static
{
}

impl<T> Store for T where
    T: QueueStore + WorkerStore + ClosingStore + ClientDirectory + PaymentStore + Clone + Send + Sync + 'static
{
}
