//!
//! Batch processing of monthly closings.
//!
//! A batch enqueues one monthly closing task per client, then claims and executes tasks from the
//! queue with a bounded number of concurrent workers until nothing is left to claim. Draining the
//! queue without enqueuing anything uses the same loop.
//!
//! The loop claims whatever is due in the queue, not only the tasks of its own batch. Tasks
//! rescheduled for a retry are usually not due before the loop ends and are reported as failed
//! attempts.
//!

use crate::audit::{AuditEntry, AuditEvent, AuditLevel, AuditLog};
use crate::clock::Clock;
use crate::exe::{DispatchOutcome, Dispatcher, WorkerPool};
use crate::messaging::{BatchId, ClientId, NewTask, TaskPayload, WorkerId, DEFAULT_MAX_RETRIES};
use crate::period::Period;
use crate::store::{Store, WorkerInstance, WorkerStatus};
use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Worker function name batches register under.
pub const BATCH_WORKER_NAME: &str = "batch-processor";

/// Worker function name queue drains register under.
pub const DRAIN_WORKER_NAME: &str = "robust-queue-processor";

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Wait between claim rounds while every worker is busy.
    pub busy_poll: Duration,

    /// Wait between claim rounds while the queue is empty but tasks are still running.
    pub idle_poll: Duration,

    /// Attempts given to every enqueued task.
    pub max_retries: u32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            busy_poll: Duration::from_millis(500),
            idle_poll: Duration::from_millis(1000),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub batch_id: BatchId,

    /// All active clients when `None`.
    pub client_ids: Option<Vec<ClientId>>,
    pub period: Period,
    pub max_concurrency: usize,
    pub priority: i32,
}

/// Summary of a finished batch or drain.
///
/// Every dispatched task is counted exactly once as completed or failed. `retried` counts the
/// failed attempts that put their task back in the queue.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub worker_id: Option<WorkerId>,
    pub enqueued: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub peak_concurrency: usize,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    fn new(batch_id: BatchId, now: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            worker_id: None,
            enqueued: 0,
            dispatched: 0,
            completed: 0,
            failed: 0,
            retried: 0,
            peak_concurrency: 0,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    fn record(&mut self, joined: Result<Result<DispatchOutcome, anyhow::Error>, JoinError>) {
        match joined {
            Ok(Ok(outcome)) => {
                debug!(outcome:?; "Task dispatched");
                match outcome {
                    DispatchOutcome::Completed { .. } => self.completed += 1,
                    DispatchOutcome::Retrying { .. } => {
                        self.failed += 1;
                        self.retried += 1;
                    }
                    DispatchOutcome::Failed { .. } | DispatchOutcome::Discarded { .. } => self.failed += 1,
                }
            }
            Ok(Err(e)) => {
                error!(e:?; "Recording task outcome failed");
                self.failed += 1;
            }
            Err(e) => {
                error!(e:?; "Task execution aborted");
                self.failed += 1;
            }
        }
    }
}

#[derive(Debug)]
pub struct BatchOrchestrator<S> {
    store: S,
    dispatcher: Arc<Dispatcher<S>>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    options: BatchOptions,
}

impl<S: Store> BatchOrchestrator<S> {
    pub fn new(
        store: S,
        dispatcher: Arc<Dispatcher<S>>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        options: BatchOptions,
    ) -> Self {
        Self { store, dispatcher, clock, audit, options }
    }

    /// Enqueue a monthly closing per client and process the queue.
    ///
    /// # Arguments
    ///
    /// `request` - Clients, period and limits of the batch.
    /// `cancel` - Stops claiming new tasks when cancelled. Running tasks still finish and are
    ///            reported.
    ///
    /// # Returns
    ///
    /// The batch report. An empty client list yields an empty report. Failing to list clients or
    /// to enqueue aborts the batch with an error.
    ///
    pub async fn run(&self, request: BatchRequest, cancel: CancellationToken) -> Result<BatchReport, anyhow::Error> {
        let BatchRequest { batch_id, client_ids, period, max_concurrency, priority } = request;
        period.validate()?;

        let client_ids = match client_ids {
            Some(ids) => ids,
            None => self
                .store
                .active_clients()
                .await
                .context("listing active clients")?
                .into_iter()
                .map(|c| c.id)
                .collect(),
        };

        let mut report = BatchReport::new(batch_id, self.clock.now());
        if client_ids.is_empty() {
            info!(batch_id; "No clients to process");
            return Ok(report);
        }

        let tasks = client_ids
            .into_iter()
            .map(|client_id| {
                let payload = TaskPayload::MonthlyClosing { period, batch_id: Some(batch_id) };
                Ok(NewTask::new(Some(client_id), &payload)?
                    .with_priority(priority)
                    .with_max_retries(self.options.max_retries))
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()?;

        let worker = self.register(BATCH_WORKER_NAME, max_concurrency).await?;
        report.worker_id = Some(worker.clone());

        self.audit.record(AuditEntry::new(
            self.clock.now(),
            AuditLevel::Info,
            AuditEvent::BatchStarted,
            format!("Batch {batch_id} started for {} client(s) in {period}", tasks.len()),
        ));

        let result = async {
            let ids = self
                .store
                .enqueue_batch(tasks, self.clock.now())
                .await
                .context("enqueuing monthly closing tasks")?;
            report.enqueued = ids.len();
            self.dispatch_loop(&worker, max_concurrency, None, &cancel, &mut report).await
        }
        .await;

        self.finish(&worker, report, result).await
    }

    /// Process due tasks without enqueuing anything.
    ///
    /// Stops after `max_tasks` tasks were dispatched, or when nothing is left to claim.
    ///
    pub async fn drain(
        &self,
        max_tasks: Option<usize>,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<BatchReport, anyhow::Error> {
        let mut report = BatchReport::new(BatchId::new(), self.clock.now());
        let worker = self.register(DRAIN_WORKER_NAME, max_concurrency).await?;
        report.worker_id = Some(worker.clone());

        let result = self.dispatch_loop(&worker, max_concurrency, max_tasks, &cancel, &mut report).await;
        self.finish(&worker, report, result).await
    }

    async fn register(&self, function_name: &str, max_concurrency: usize) -> Result<WorkerId, anyhow::Error> {
        let worker = WorkerInstance::new(function_name, max_concurrency, self.clock.now());
        let worker_id = worker.worker_id.clone();
        self.store.register_worker(worker).await.context("registering worker")?;

        self.audit.record(
            AuditEntry::new(self.clock.now(), AuditLevel::Info, AuditEvent::WorkerRegistered, "Worker registered")
                .worker(&worker_id),
        );
        Ok(worker_id)
    }

    async fn finish(
        &self,
        worker_id: &WorkerId,
        mut report: BatchReport,
        result: Result<(), anyhow::Error>,
    ) -> Result<BatchReport, anyhow::Error> {
        match self.store.deregister_worker(worker_id.clone()).await {
            Ok(_) => self.audit.record(
                AuditEntry::new(self.clock.now(), AuditLevel::Info, AuditEvent::WorkerDeregistered, "Worker deregistered")
                    .worker(worker_id),
            ),
            Err(e) => warn!(worker_id, e:?; "Deregistering worker failed"),
        }
        result?;

        report.finished_at = self.clock.now();
        self.audit.record(AuditEntry::new(
            report.finished_at,
            AuditLevel::Info,
            AuditEvent::BatchFinished,
            format!(
                "Batch {} finished: {} dispatched, {} completed, {} failed{}",
                report.batch_id,
                report.dispatched,
                report.completed,
                report.failed,
                if report.cancelled { " (cancelled)" } else { "" }
            ),
        ));
        Ok(report)
    }

    /// Claim while the pool has room, until nothing is claimable and nothing is running.
    async fn dispatch_loop(
        &self,
        worker_id: &WorkerId,
        max_concurrency: usize,
        max_tasks: Option<usize>,
        cancel: &CancellationToken,
        report: &mut BatchReport,
    ) -> Result<(), anyhow::Error> {
        let mut pool = WorkerPool::new(max_concurrency);
        let mut claim_error = None;
        let mut draining = false;

        loop {
            while let Some(joined) = pool.try_join_next() {
                report.record(joined);
            }

            let stopped = cancel.is_cancelled()
                || claim_error.is_some()
                || max_tasks.is_some_and(|max| report.dispatched >= max);
            if stopped && !draining && !pool.is_idle() {
                draining = true;
                self.set_status(worker_id, WorkerStatus::Draining).await;
            }

            let mut queue_empty = false;
            if !stopped && pool.has_capacity() {
                match self.dispatcher.claim(worker_id).await {
                    Ok(Some(task)) => {
                        report.dispatched += 1;
                        let dispatcher = self.dispatcher.clone();
                        let worker_id = worker_id.clone();
                        let spawned = pool.try_spawn(async move { dispatcher.execute(task, &worker_id).await });
                        if spawned.is_err() {
                            // Capacity was checked above and only this loop spawns.
                            error!("Worker pool refused a claimed task");
                        }
                        continue;
                    }
                    Ok(None) => queue_empty = true,
                    Err(e) => {
                        warn!(e:?; "Claiming failed, finishing running tasks");
                        claim_error = Some(e);
                    }
                }
            }

            if pool.is_idle() && (stopped || queue_empty || claim_error.is_some()) {
                break;
            }

            self.heartbeat(worker_id, pool.active()).await;
            let wait = if pool.has_capacity() { self.options.idle_poll } else { self.options.busy_poll };
            select! {
                biased;

                _ = cancel.cancelled(), if !stopped => {
                    info!(batch_id = report.batch_id; "Batch cancelled, no new tasks will be claimed");
                }
                Some(joined) = pool.join_next() => report.record(joined),
                _ = sleep(wait) => {}
            }
        }

        report.peak_concurrency = pool.peak();
        report.cancelled = cancel.is_cancelled();
        match claim_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn set_status(&self, worker_id: &WorkerId, status: WorkerStatus) {
        if let Err(e) = self.store.set_worker_status(worker_id.clone(), status).await {
            warn!(worker_id, status:?, e:?; "Updating worker status failed");
        }
    }

    async fn heartbeat(&self, worker_id: &WorkerId, active: usize) {
        if let Err(e) = self.store.heartbeat(worker_id.clone(), active, self.clock.now()).await {
            warn!(worker_id, e:?; "Worker heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use crate::clock::SystemClock;
    use crate::exe::{handler_fn, HandlerRegistry};
    use crate::messaging::TaskKind;
    use crate::notifications::NotificationCenter;
    use crate::store::{InMemoryStore, QueueStore, SeedData, StoreOp, WorkerStore};
    use anyhow::anyhow;
    use serde_json::json;

    fn orchestrator(store: &InMemoryStore, handlers: HandlerRegistry) -> BatchOrchestrator<InMemoryStore> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let audit = Arc::new(AuditLog::new(200));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            handlers,
            clock.clone(),
            audit.clone(),
            Arc::new(NotificationCenter::new(50)),
        ));
        let options = BatchOptions {
            busy_poll: Duration::from_millis(10),
            idle_poll: Duration::from_millis(10),
            ..BatchOptions::default()
        };
        BatchOrchestrator::new(store.clone(), dispatcher, clock, audit, options)
    }

    fn succeed() -> HandlerRegistry {
        HandlerRegistry::new()
            .register(TaskKind::MonthlyClosing, handler_fn(|_task, _payload| async { Ok(json!("ok")) }))
    }

    fn request(client_ids: Option<Vec<ClientId>>, max_concurrency: usize) -> Result<BatchRequest, anyhow::Error> {
        Ok(BatchRequest {
            batch_id: BatchId::new(),
            client_ids,
            period: Period::new(1, 2025)?,
            max_concurrency,
            priority: 1,
        })
    }

    #[tokio::test]
    async fn empty_client_list_yields_empty_report() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let batches = orchestrator(&store, succeed());

        let report = batches.run(request(Some(vec![]), 5)?, CancellationToken::new()).await?;
        assert_eq!(report.enqueued, 0);
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.worker_id, None);

        let report = batches.run(request(None, 5)?, CancellationToken::new()).await?;
        assert_eq!(report.enqueued, 0);
        assert!(store.list_workers().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn batch_processes_every_active_client() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let clients = (0..4).map(|n| Client::new(format!("c-{n}"), "Client")).collect();
        store.seed(SeedData { clients, payments: vec![] }).await;
        let batches = orchestrator(&store, succeed());

        let report = batches.run(request(None, 2)?, CancellationToken::new()).await?;
        assert_eq!(report.enqueued, 4);
        assert_eq!(report.dispatched, 4);
        assert_eq!(report.completed, 4);
        assert!(report.peak_concurrency <= 2);
        assert!(!report.cancelled);

        // The batch worker is gone once the batch is over.
        assert!(store.list_workers().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failing_tasks_are_counted_as_retried() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let handlers = HandlerRegistry::new().register(
            TaskKind::MonthlyClosing,
            handler_fn(|_task, _payload| async { Err(anyhow!("bank feed unavailable")) }),
        );
        let batches = orchestrator(&store, handlers);

        let clients = vec![ClientId::from("a"), ClientId::from("b")];
        let report = batches.run(request(Some(clients), 5)?, CancellationToken::new()).await?;
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.retried, 2);
        assert_eq!(report.completed + report.failed, report.dispatched);
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_failure_aborts_batch_and_deregisters() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        store.inject_failure(StoreOp::Enqueue, 1).await;
        let batches = orchestrator(&store, succeed());

        let err = batches
            .run(request(Some(vec![ClientId::from("a")]), 5)?, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "enqueuing monthly closing tasks");
        assert!(store.list_workers().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_batch_claims_nothing() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let batches = orchestrator(&store, succeed());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = batches.run(request(Some(vec![ClientId::from("a")]), 5)?, cancel).await?;
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.dispatched, 0);
        assert!(report.cancelled);
        assert_eq!(store.queue_stats(Utc::now()).await?.pending, 1);
        Ok(())
    }

    #[tokio::test]
    async fn drain_respects_max_tasks() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        for n in 0..5 {
            let payload = TaskPayload::MonthlyClosing { period: Period::new(1, 2025)?, batch_id: None };
            store.enqueue(NewTask::new(Some(format!("c-{n}").into()), &payload)?, Utc::now()).await?;
        }
        let batches = orchestrator(&store, succeed());

        let report = batches.drain(Some(3), 1, CancellationToken::new()).await?;
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.completed, 3);
        assert_eq!(store.queue_stats(Utc::now()).await?.pending, 2);
        Ok(())
    }
}
