use crate::clock::Clock;
use crate::exe::{DispatchOutcome, Dispatcher, WorkerPool};
use crate::messaging::WorkerId;
use crate::service::Service;
use crate::store::{Store, WorkerInstance, WorkerStatus};
use anyhow::Context;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinError;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Worker function name of the long-running queue processor.
pub const PROCESSOR_WORKER_NAME: &str = "queue-processor";

type Joined = Result<Result<DispatchOutcome, anyhow::Error>, JoinError>;

#[derive(Debug)]
pub enum ProcessorEvent {
    /// Time to claim due tasks.
    Tick,

    /// A dispatched task finished.
    Finished(Joined),
}

/// Service claiming due tasks on an interval and executing them in the background.
pub struct QueueProcessor<S> {
    store: S,
    dispatcher: Arc<Dispatcher<S>>,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
    pool: WorkerPool<Result<DispatchOutcome, anyhow::Error>>,
    ticks: Interval,
}

impl<S: Store> QueueProcessor<S> {
    /// Register the processor as a worker.
    pub async fn new(
        store: S,
        dispatcher: Arc<Dispatcher<S>>,
        clock: Arc<dyn Clock>,
        tick: Duration,
        concurrency: usize,
    ) -> Result<Self, anyhow::Error> {
        let worker = WorkerInstance::new(PROCESSOR_WORKER_NAME, concurrency, clock.now());
        let worker_id = worker.worker_id.clone();
        store.register_worker(worker).await.context("registering queue processor")?;
        info!(worker_id; "Queue processor registered");

        let mut ticks = interval(tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self { store, dispatcher, clock, worker_id, pool: WorkerPool::new(concurrency), ticks })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn finished(&self, joined: Joined) {
        match joined {
            Ok(Ok(outcome)) => debug!(worker_id = self.worker_id, outcome:?; "Task dispatched"),
            Ok(Err(e)) => error!(worker_id = self.worker_id, e:?; "Recording task outcome failed"),
            Err(e) => error!(worker_id = self.worker_id, e:?; "Task execution aborted"),
        }
    }

    async fn claim_due(&mut self) {
        while self.pool.has_capacity() {
            let task = match self.dispatcher.claim(&self.worker_id).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = self.worker_id, e:?; "Claiming failed");
                    break;
                }
            };

            let dispatcher = self.dispatcher.clone();
            let worker_id = self.worker_id.clone();
            if self.pool.try_spawn(async move { dispatcher.execute(task, &worker_id).await }).is_err() {
                error!(worker_id = self.worker_id; "Worker pool refused a claimed task");
                break;
            }
        }
    }
}

impl<S: Store> Service for QueueProcessor<S> {
    type TaskOutput = ProcessorEvent;

    async fn poll_task(&mut self) -> Self::TaskOutput {
        let idle = self.pool.is_idle();
        select! {
            Some(joined) = self.pool.join_next(), if !idle => ProcessorEvent::Finished(joined),
            _ = self.ticks.tick() => ProcessorEvent::Tick,
        }
    }

    async fn on_task_ready(&mut self, event: Self::TaskOutput) -> Result<(), anyhow::Error> {
        match event {
            ProcessorEvent::Tick => {
                self.claim_due().await;
                let active = self.pool.active();
                if let Err(e) = self.store.heartbeat(self.worker_id.clone(), active, self.clock.now()).await {
                    warn!(worker_id = self.worker_id, e:?; "Worker heartbeat failed");
                }
            }
            ProcessorEvent::Finished(joined) => self.finished(joined),
        }
        Ok(())
    }

    async fn on_terminate(&mut self) -> Result<(), anyhow::Error> {
        if let Err(e) = self.store.set_worker_status(self.worker_id.clone(), WorkerStatus::Draining).await {
            warn!(worker_id = self.worker_id, e:?; "Marking queue processor draining failed");
        }
        for joined in self.pool.drain().await {
            self.finished(joined);
        }
        self.store
            .deregister_worker(self.worker_id.clone())
            .await
            .context("deregistering queue processor")?;
        info!(worker_id = self.worker_id; "Queue processor stopped");
        Ok(())
    }
}
