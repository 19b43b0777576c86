use crate::audit::{AuditEntry, AuditEvent, AuditLevel, AuditLog};
use crate::clock::Clock;
use crate::exe::{DispatchOutcome, Dispatcher};
use crate::service::Service;
use crate::store::{Store, WorkerInstance, WorkerStore};
use anyhow::{anyhow, Context};
use chrono::Duration;
use log::warn;
use std::sync::Arc;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};

/// Remove workers whose last heartbeat is older than `offline_after`.
pub async fn cleanup_offline_workers<S>(
    store: &S,
    clock: &dyn Clock,
    audit: &AuditLog,
    offline_after: Duration,
) -> Result<Vec<WorkerInstance>, anyhow::Error>
where
    S: WorkerStore + Sync,
{
    let now = clock.now();
    let cutoff = now
        .checked_sub_signed(offline_after)
        .ok_or_else(|| anyhow!("offline threshold {offline_after} is out of range"))?;
    let removed = store
        .cleanup_offline_workers(cutoff)
        .await
        .context("cleaning up offline workers")?;

    if !removed.is_empty() {
        let ids: Vec<&str> = removed.iter().map(|w| w.worker_id.as_str()).collect();
        audit.record(AuditEntry::new(
            now,
            AuditLevel::Warning,
            AuditEvent::WorkersCleanedUp,
            format!("Removed {} offline worker(s): {}", removed.len(), ids.join(", ")),
        ));
    }
    Ok(removed)
}

/// What one janitor pass cleaned up.
#[derive(Debug, Default)]
pub struct Sweep {
    pub removed_workers: Vec<WorkerInstance>,
    pub recovered_tasks: Vec<DispatchOutcome>,
}

/// Service removing offline workers and recovering tasks with expired leases.
pub struct Janitor<S> {
    store: S,
    dispatcher: Arc<Dispatcher<S>>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    offline_after: Duration,
    ticks: Interval,
}

impl<S: Store> Janitor<S> {
    pub fn new(
        store: S,
        dispatcher: Arc<Dispatcher<S>>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        offline_after: Duration,
        every: std::time::Duration,
    ) -> Self {
        let mut ticks = interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { store, dispatcher, clock, audit, offline_after, ticks }
    }

    pub async fn sweep(&self) -> Result<Sweep, anyhow::Error> {
        let removed_workers =
            cleanup_offline_workers(&self.store, self.clock.as_ref(), &self.audit, self.offline_after).await?;
        let recovered_tasks = self.dispatcher.recover_expired_leases().await?;
        Ok(Sweep { removed_workers, recovered_tasks })
    }
}

impl<S: Store> Service for Janitor<S> {
    type TaskOutput = Instant;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        self.ticks.tick().await
    }

    async fn on_task_ready(&mut self, _tick: Self::TaskOutput) -> Result<(), anyhow::Error> {
        // A failed sweep is retried on the next tick.
        if let Err(e) = self.sweep().await {
            warn!(e:?; "Janitor sweep failed");
        }
        Ok(())
    }
}
