//!
//! A trivial, inefficient implementation of the stores.
//!
//! All tables live in memory behind a single lock, which is what makes a claim atomic: selecting
//! the next task and marking it processing happen under the same guard. All data is lost when the
//! process exits.
//!
//! Failures can be injected per operation, so callers' error paths can be exercised.
//!

use crate::clients::Client;
use crate::closing::{ChecklistItem, ClosingStatus, ClosingWithItems};
use crate::messaging::{
    ChecklistItemId, ClientId, ClosingId, NewTask, QueueTask, TaskId, TaskStatus, WorkerId,
};
use crate::payments::Payment;
use crate::period::Period;
use crate::store::{
    ClientDirectory, ClosingStore, PaymentStore, QueueStats, QueueStore, StoreError, WorkerInstance,
    WorkerStatus, WorkerStore,
};
use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Store operations that can be made to fail.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum StoreOp {
    Enqueue,
    ClaimNext,
    Complete,
    Reschedule,
    Fail,
    RegisterWorker,
    ClosingsForPeriod,
    InsertClosings,
    InsertChecklistItems,
    UpdateClosing,
    UpdateChecklistItem,
    ActiveClients,
    OverduePayments,
}

/// Initial contents of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub payments: Vec<Payment>,
}

impl SeedData {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing seed file {}", path.display()))
    }
}

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<TaskId, QueueTask>,
    workers: HashMap<WorkerId, WorkerInstance>,
    closings: HashMap<ClosingId, ClosingStatus>,
    items: HashMap<ChecklistItemId, ChecklistItem>,
    clients: Vec<Client>,
    payments: Vec<Payment>,
    faults: HashMap<StoreOp, u32>,
}

impl Tables {
    fn check_fault(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Unavailable(format!("injected failure in {op:?}")))
            }
            _ => Ok(()),
        }
    }

    /// A task currently claimed by `worker_id`.
    fn claimed_task(&mut self, task_id: TaskId, worker_id: &WorkerId) -> Result<&mut QueueTask, StoreError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if task.status != TaskStatus::Processing {
            return Err(StoreError::InvalidTransition { task_id, from: task.status });
        }
        if task.worker_id.as_ref() != Some(worker_id) {
            return Err(StoreError::NotOwner { task_id, worker_id: worker_id.clone() });
        }
        Ok(task)
    }

    fn with_items(&self, closing: &ClosingStatus) -> ClosingWithItems {
        let mut items: Vec<ChecklistItem> = self
            .items
            .values()
            .filter(|i| i.closing_id == closing.id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.title.cmp(&b.title)));
        ClosingWithItems { closing: closing.clone(), items }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, seed: SeedData) {
        let mut tables = self.tables.lock().await;
        for client in seed.clients {
            upsert_client(&mut tables.clients, client);
        }
        tables.payments.extend(seed.payments);
    }

    /// Make the next `times` calls of `op` fail with [`StoreError::Unavailable`].
    pub async fn inject_failure(&self, op: StoreOp, times: u32) {
        self.tables.lock().await.faults.insert(op, times);
    }

    pub async fn tasks(&self) -> Vec<QueueTask> {
        self.tables.lock().await.tasks.values().cloned().collect()
    }

    pub async fn checklist_item_count(&self) -> usize {
        self.tables.lock().await.items.len()
    }
}

fn upsert_client(clients: &mut Vec<Client>, client: Client) {
    match clients.iter_mut().find(|c| c.id == client.id) {
        Some(existing) => *existing = client,
        None => clients.push(client),
    }
}

impl QueueStore for InMemoryStore {
    async fn enqueue(&self, task: NewTask, now: DateTime<Utc>) -> Result<QueueTask, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::Enqueue)?;

        let task = QueueTask::from_new(task, now);
        trace!(id = task.id, task_type = task.task_type.as_str(); "Task enqueued");
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn enqueue_batch(&self, tasks: Vec<NewTask>, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::Enqueue)?;

        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task = QueueTask::from_new(task, now);
            ids.push(task.id);
            tables.tasks.insert(task.id, task);
        }
        trace!(count = ids.len(); "Tasks enqueued");
        Ok(ids)
    }

    async fn claim_next(
        &self,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<QueueTask>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::ClaimNext)?;

        for task in tables
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Pending && t.retry_count >= t.max_retries)
        {
            warn!(id = task.id, retry_count = task.retry_count; "Failing pending task without retries left");
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.error_details.get_or_insert_with(|| "retry limit exhausted".to_owned());
        }

        let next = tables
            .tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .min_by(|a, b| {
                (a.priority, a.scheduled_at, a.created_at, a.id)
                    .cmp(&(b.priority, b.scheduled_at, b.created_at, b.id))
            })
            .map(|t| t.id);

        let Some(task_id) = next else {
            return Ok(None);
        };
        let Some(task) = tables.tasks.get_mut(&task_id) else {
            return Ok(None);
        };

        task.status = TaskStatus::Processing;
        task.started_at = Some(now);
        task.timeout_at = now.checked_add_signed(lease);
        task.worker_id = Some(worker_id);
        Ok(Some(task.clone()))
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<QueueTask, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::Complete)?;

        let task = tables.claimed_task(task_id, &worker_id)?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.result = Some(result);
        task.error_details = None;
        Ok(task.clone())
    }

    async fn reschedule(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        retry_count: u32,
        error: String,
        scheduled_at: DateTime<Utc>,
    ) -> Result<QueueTask, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::Reschedule)?;

        let task = tables.claimed_task(task_id, &worker_id)?;
        task.status = TaskStatus::Pending;
        task.retry_count = retry_count;
        task.scheduled_at = scheduled_at;
        task.started_at = None;
        task.timeout_at = None;
        task.error_details = Some(error);
        Ok(task.clone())
    }

    async fn fail(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        retry_count: u32,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<QueueTask, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::Fail)?;

        let task = tables.claimed_task(task_id, &worker_id)?;
        task.status = TaskStatus::Failed;
        task.retry_count = retry_count;
        task.completed_at = Some(now);
        task.timeout_at = None;
        task.error_details = Some(error);
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<QueueTask>, StoreError> {
        Ok(self.tables.lock().await.tasks.get(&task_id).cloned())
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<QueueTask>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing && t.timeout_at.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let tables = self.tables.lock().await;
        let mut stats = QueueStats::default();
        for task in tables.tasks.values() {
            match task.status {
                TaskStatus::Pending => {
                    stats.pending += 1;
                    if task.is_claimable(now) {
                        stats.due += 1;
                        stats.oldest_due_at = Some(match stats.oldest_due_at {
                            Some(oldest) => oldest.min(task.scheduled_at),
                            None => task.scheduled_at,
                        });
                    }
                }
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

impl WorkerStore for InMemoryStore {
    async fn register_worker(&self, worker: WorkerInstance) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::RegisterWorker)?;

        if tables.workers.contains_key(&worker.worker_id) {
            return Err(StoreError::Conflict(format!("worker {} already registered", worker.worker_id)));
        }
        tables.workers.insert(worker.worker_id.clone(), worker);
        Ok(())
    }

    async fn heartbeat(&self, worker_id: WorkerId, current_task_count: usize, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let worker = tables
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| StoreError::not_found("worker", &worker_id))?;
        worker.current_task_count = current_task_count;
        worker.last_heartbeat = now;
        Ok(())
    }

    async fn set_worker_status(&self, worker_id: WorkerId, status: WorkerStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let worker = tables
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| StoreError::not_found("worker", &worker_id))?;
        worker.status = status;
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: WorkerId) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.workers.remove(&worker_id).is_some())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInstance>, StoreError> {
        let tables = self.tables.lock().await;
        let mut workers: Vec<WorkerInstance> = tables.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(workers)
    }

    async fn cleanup_offline_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerInstance>, StoreError> {
        let mut tables = self.tables.lock().await;
        let offline: Vec<WorkerId> = tables
            .workers
            .values()
            .filter(|w| w.last_heartbeat < cutoff)
            .map(|w| w.worker_id.clone())
            .collect();

        Ok(offline.iter().filter_map(|id| tables.workers.remove(id)).collect())
    }
}

impl ClosingStore for InMemoryStore {
    async fn closings_for_period(&self, period: Period) -> Result<Vec<ClosingWithItems>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::ClosingsForPeriod)?;

        let mut closings: Vec<ClosingWithItems> = tables
            .closings
            .values()
            .filter(|c| c.period == period)
            .map(|c| tables.with_items(c))
            .collect();
        closings.sort_by(|a, b| a.closing.client_id.cmp(&b.closing.client_id));
        Ok(closings)
    }

    async fn closing_for_client(&self, client_id: ClientId, period: Period) -> Result<Option<ClosingWithItems>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .closings
            .values()
            .find(|c| c.client_id == client_id && c.period == period)
            .map(|c| tables.with_items(c)))
    }

    async fn get_closing(&self, closing_id: ClosingId) -> Result<Option<ClosingWithItems>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.closings.get(&closing_id).map(|c| tables.with_items(c)))
    }

    async fn insert_closings(&self, closings: Vec<ClosingStatus>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::InsertClosings)?;

        for closing in &closings {
            let duplicate = tables
                .closings
                .values()
                .any(|c| c.client_id == closing.client_id && c.period == closing.period);
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "closing for client {} in {} already exists",
                    closing.client_id, closing.period
                )));
            }
        }

        for closing in closings {
            tables.closings.insert(closing.id, closing);
        }
        Ok(())
    }

    async fn insert_checklist_items(&self, items: Vec<ChecklistItem>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::InsertChecklistItems)?;

        if let Some(orphan) = items.iter().find(|i| !tables.closings.contains_key(&i.closing_id)) {
            return Err(StoreError::not_found("closing", orphan.closing_id));
        }
        for item in items {
            tables.items.insert(item.id, item);
        }
        Ok(())
    }

    async fn update_closing(&self, closing: ClosingStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::UpdateClosing)?;

        match tables.closings.get_mut(&closing.id) {
            Some(existing) => {
                *existing = closing;
                Ok(())
            }
            None => Err(StoreError::not_found("closing", closing.id)),
        }
    }

    async fn get_checklist_item(&self, item_id: ChecklistItemId) -> Result<Option<ChecklistItem>, StoreError> {
        Ok(self.tables.lock().await.items.get(&item_id).cloned())
    }

    async fn update_checklist_item(&self, item: ChecklistItem) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::UpdateChecklistItem)?;

        match tables.items.get_mut(&item.id) {
            Some(existing) => {
                *existing = item;
                Ok(())
            }
            None => Err(StoreError::not_found("checklist item", item.id)),
        }
    }
}

impl ClientDirectory for InMemoryStore {
    async fn active_clients(&self) -> Result<Vec<Client>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::ActiveClients)?;
        Ok(tables.clients.iter().filter(|c| c.active).cloned().collect())
    }

    async fn upsert_client(&self, client: Client) -> Result<(), StoreError> {
        upsert_client(&mut self.tables.lock().await.clients, client);
        Ok(())
    }
}

impl PaymentStore for InMemoryStore {
    async fn overdue_payments(&self, today: NaiveDate) -> Result<Vec<Payment>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.check_fault(StoreOp::OverduePayments)?;
        Ok(tables.payments.iter().filter(|p| p.is_overdue(today)).cloned().collect())
    }

    async fn record_payment(&self, payment: Payment) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.payments.iter_mut().find(|p| p.id == payment.id) {
            Some(existing) => *existing = payment,
            None => tables.payments.push(payment),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{TaskPayload, DEFAULT_MAX_RETRIES};
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 9, minute, 0).unwrap()
    }

    fn compliance_task(priority: i32) -> NewTask {
        let payload = TaskPayload::ComplianceCheck { period: Period { year: 2025, month: 1 } };
        NewTask::new(None, &payload).unwrap().with_priority(priority)
    }

    #[tokio::test]
    async fn claims_by_priority_then_schedule() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let late = store.enqueue(compliance_task(1).scheduled_at(at(5)), at(0)).await?;
        let low = store.enqueue(compliance_task(3), at(0)).await?;
        let early = store.enqueue(compliance_task(1).scheduled_at(at(1)), at(0)).await?;
        let worker = WorkerId::from("w-1");

        let lease = Duration::minutes(10);
        let claimed = store.claim_next(worker.clone(), at(10), lease).await?.unwrap();
        assert_eq!(claimed.id, early.id);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.timeout_at, Some(at(20)));
        assert_eq!(claimed.worker_id, Some(worker.clone()));

        assert_eq!(store.claim_next(worker.clone(), at(10), lease).await?.unwrap().id, late.id);
        assert_eq!(store.claim_next(worker.clone(), at(10), lease).await?.unwrap().id, low.id);
        assert!(store.claim_next(worker, at(10), lease).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn tasks_scheduled_in_the_future_are_not_claimed() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        store.enqueue(compliance_task(1).scheduled_at(at(30)), at(0)).await?;
        let claimed = store.claim_next(WorkerId::from("w-1"), at(29), Duration::minutes(1)).await?;
        assert!(claimed.is_none());
        assert_eq!(store.queue_stats(at(29)).await?.due, 0);
        assert_eq!(store.queue_stats(at(30)).await?.due, 1);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_pending_tasks_are_failed_instead_of_claimed() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let task = store.enqueue(compliance_task(1).with_max_retries(0), at(0)).await?;

        assert!(store.claim_next(WorkerId::from("w-1"), at(1), Duration::minutes(1)).await?.is_none());
        let task = store.get_task(task.id).await?.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_details.as_deref(), Some("retry limit exhausted"));
        Ok(())
    }

    #[tokio::test]
    async fn only_the_claiming_worker_can_complete() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        store.enqueue(compliance_task(1), at(0)).await?;
        let owner = WorkerId::from("w-owner");
        let task = store.claim_next(owner.clone(), at(0), Duration::minutes(1)).await?.unwrap();

        let stranger = store.complete(task.id, WorkerId::from("w-other"), serde_json::Value::Null, at(1)).await;
        assert!(matches!(stranger, Err(StoreError::NotOwner { .. })));

        let done = store.complete(task.id, owner.clone(), serde_json::json!({"ok": true}), at(1)).await?;
        assert_eq!(done.status, TaskStatus::Completed);

        let again = store.complete(task.id, owner, serde_json::Value::Null, at(2)).await;
        assert!(matches!(again, Err(StoreError::InvalidTransition { from: TaskStatus::Completed, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_each_task_once() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let tasks = (0..20).map(|_| compliance_task(1)).collect();
        store.enqueue_batch(tasks, at(0)).await?;

        let mut claimers = tokio::task::JoinSet::new();
        for n in 0..8 {
            let store = store.clone();
            claimers.spawn(async move {
                let worker = WorkerId::from(format!("w-{n}"));
                let mut claimed = vec![];
                while let Some(task) = store.claim_next(worker.clone(), at(1), Duration::minutes(5)).await? {
                    claimed.push(task.id);
                }
                Ok::<_, StoreError>(claimed)
            });
        }

        let mut all = vec![];
        while let Some(result) = claimers.join_next().await {
            all.extend(result??);
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
        Ok(())
    }

    #[tokio::test]
    async fn expired_leases_are_reported() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        store.enqueue(compliance_task(1), at(0)).await?;
        let task = store.claim_next(WorkerId::from("w-1"), at(0), Duration::minutes(10)).await?.unwrap();

        assert!(store.expired_leases(at(9)).await?.is_empty());
        let expired = store.expired_leases(at(10)).await?;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, task.id);
        assert_eq!(expired[0].max_retries, DEFAULT_MAX_RETRIES);
        Ok(())
    }

    #[tokio::test]
    async fn offline_workers_are_cleaned_up() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let stale = WorkerInstance::new("queue-processor", 4, at(0));
        let fresh = WorkerInstance::new("batch-closing", 5, at(0));
        store.register_worker(stale.clone()).await?;
        store.register_worker(fresh.clone()).await?;
        store.heartbeat(fresh.worker_id.clone(), 2, at(9)).await?;

        let removed = store.cleanup_offline_workers(at(5)).await?;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].worker_id, stale.worker_id);

        let remaining = store.list_workers().await?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].current_task_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn worker_status_changes_are_kept() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let worker = WorkerInstance::new("batch-processor", 2, at(0));
        store.register_worker(worker.clone()).await?;

        store.set_worker_status(worker.worker_id.clone(), WorkerStatus::Draining).await?;
        assert_eq!(store.list_workers().await?[0].status, WorkerStatus::Draining);

        let unknown = store.set_worker_status(WorkerId::from("ghost"), WorkerStatus::Draining).await;
        assert!(matches!(unknown, Err(StoreError::NotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        store.inject_failure(StoreOp::ActiveClients, 1).await;
        assert!(matches!(store.active_clients().await, Err(StoreError::Unavailable(_))));
        assert!(store.active_clients().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn inactive_clients_are_not_listed() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let mut inactive = Client::new("c-2", "Padaria Dois Irmãos");
        inactive.active = false;
        store
            .seed(SeedData { clients: vec![Client::new("c-1", "Mercado Central"), inactive], payments: vec![] })
            .await;

        let active = store.active_clients().await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, ClientId::from("c-1"));
        Ok(())
    }
}
