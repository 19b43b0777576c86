use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::closing::ClosingTracker;
use crate::exe::{BatchOptions, BatchOrchestrator, Dispatcher, HandlerRegistry};
use crate::messaging::BatchId;
use crate::notifications::NotificationCenter;
use crate::options::ContaflixOptions;
use crate::payments::PaymentMonitor;
use crate::retry::RetryPolicy;
use crate::store::Store;
use anyhow::bail;
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

type RunningBatches = Mutex<HashMap<BatchId, CancellationToken>>;

/// Everything a request handler needs, shared by all connections and services.
#[derive(Debug, Clone)]
pub struct AppContext<S> {
    pub store: S,
    pub options: Arc<ContaflixOptions>,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<AuditLog>,
    pub notifications: Arc<NotificationCenter>,
    pub tracker: Arc<ClosingTracker<S>>,
    pub dispatcher: Arc<Dispatcher<S>>,
    pub batches: Arc<BatchOrchestrator<S>>,
    pub payments: Arc<PaymentMonitor<S>>,
    running: Arc<RunningBatches>,
    shutdown: CancellationToken,
}

impl<S: Store> AppContext<S> {
    /// Wire the application around `store`.
    ///
    /// # Arguments
    ///
    /// `store` - Backing store shared by every component.
    /// `options` - Server options.
    /// `clock` - Source of the current time.
    /// `shutdown` - Cancelled when the server stops. Running batches are cancelled with it.
    ///
    pub fn new(store: S, options: ContaflixOptions, clock: Arc<dyn Clock>, shutdown: CancellationToken) -> Self {
        let audit = Arc::new(AuditLog::new(options.audit_capacity()));
        let notifications = Arc::new(NotificationCenter::new(options.notification_capacity()));

        let mut tracker = ClosingTracker::new(store.clone(), clock.clone(), audit.clone(), notifications.clone());
        if let Some(seed) = options.simulation_seed {
            tracker = tracker.with_seed(seed);
        }
        let tracker = Arc::new(tracker);

        let dispatcher = Dispatcher::new(
            store.clone(),
            HandlerRegistry::closing(tracker.clone()),
            clock.clone(),
            audit.clone(),
            notifications.clone(),
        )
        .with_retry_policy(RetryPolicy { base_delay: options.retry_base_delay(), max_delay: None })
        .with_lease(options.lease_timeout());
        let dispatcher = Arc::new(dispatcher);

        let batch_options = BatchOptions {
            busy_poll: options.busy_poll(),
            idle_poll: options.idle_poll(),
            max_retries: options.max_retries(),
        };
        let batches = Arc::new(BatchOrchestrator::new(
            store.clone(),
            dispatcher.clone(),
            clock.clone(),
            audit.clone(),
            batch_options,
        ));
        let payments = Arc::new(PaymentMonitor::new(store.clone(), clock.clone(), notifications.clone()));

        Self {
            store,
            options: Arc::new(options),
            clock,
            audit,
            notifications,
            tracker,
            dispatcher,
            batches,
            payments,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Track a batch as running until the returned guard is dropped.
    pub(crate) fn begin_batch(&self, batch_id: BatchId) -> Result<RunningBatch<'_>, anyhow::Error> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains_key(&batch_id) {
            bail!("batch {batch_id} is already running");
        }

        let token = self.shutdown.child_token();
        running.insert(batch_id, token.clone());
        Ok(RunningBatch { running: &self.running, batch_id, token })
    }

    /// Stop a running batch from claiming new tasks.
    ///
    /// # Returns
    ///
    /// Whether the batch was running.
    ///
    pub fn cancel_batch(&self, batch_id: BatchId) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(&batch_id) {
            Some(token) => {
                info!(batch_id; "Cancelling batch");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_batches(&self) -> Vec<BatchId> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.keys().copied().collect()
    }
}

pub(crate) struct RunningBatch<'a> {
    running: &'a RunningBatches,
    batch_id: BatchId,
    token: CancellationToken,
}

impl RunningBatch<'_> {
    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunningBatch<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.remove(&self.batch_id);
    }
}
