//!
//! Per-client monthly closing tracking.
//!
//! A closing is created for every active client that has none when a period is looked at, each
//! with the same five-item checklist. Checklist items are then completed by queue tasks or by hand, and
//! the closing's status follows its validation progress.
//!
//! Durations of automatically completed items and document counts of new closings are simulated:
//! there is no real reconciliation behind them yet.
//!

use crate::audit::{AuditEntry, AuditEvent, AuditLevel, AuditLog};
use crate::clock::Clock;
use crate::closing::{
    default_checklist, ChecklistItem, ChecklistItemType, ClosingState, ClosingStatus, ClosingWithItems,
    ItemStatus, PeriodSummary,
};
use crate::messaging::{ChecklistItemId, ClientId, ClosingId};
use crate::notifications::{NotificationCenter, NotificationKind};
use crate::period::Period;
use crate::store::{ClientDirectory, ClosingStore};
use anyhow::{anyhow, Context};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Most checklist items completed by one intelligent closing step.
pub const MAX_ITEMS_PER_STEP: usize = 3;

/// Simulated minutes spent on an automatically completed item.
pub const SIMULATED_ITEM_MINUTES: RangeInclusive<u32> = 5..=20;

/// Simulated number of documents received by a client in a period.
pub const SIMULATED_DOCUMENT_COUNT: RangeInclusive<u32> = 10..=50;

/// Outcome of advancing one closing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingStepReport {
    pub closing_id: ClosingId,
    pub client_id: ClientId,
    pub period: Period,
    pub items_completed: Vec<ChecklistItemId>,
    pub status: ClosingState,
    pub validations_passed: u32,
    pub validations_total: u32,
    /// Set when the closing was left untouched.
    pub skipped: Option<String>,
}

impl ClosingStepReport {
    fn new(closing: &ClosingStatus, items_completed: Vec<ChecklistItemId>, skipped: Option<String>) -> Self {
        Self {
            closing_id: closing.id,
            client_id: closing.client_id.clone(),
            period: closing.period,
            items_completed,
            status: closing.status,
            validations_passed: closing.validations_passed,
            validations_total: closing.validations_total,
            skipped,
        }
    }
}

#[derive(Debug)]
pub struct ClosingTracker<S> {
    store: S,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    notifications: Arc<NotificationCenter>,
    rng: Mutex<StdRng>,

    /// Held while closings are created.
    init_lock: Mutex<()>,

    /// One lock per closing, held while the closing or its items change.
    closing_locks: Mutex<HashMap<ClosingId, Arc<Mutex<()>>>>,
}

impl<S> ClosingTracker<S>
where
    S: ClosingStore + ClientDirectory + Send + Sync,
{
    pub fn new(store: S, clock: Arc<dyn Clock>, audit: Arc<AuditLog>, notifications: Arc<NotificationCenter>) -> Self {
        Self {
            store,
            clock,
            audit,
            notifications,
            rng: Mutex::new(StdRng::from_os_rng()),
            init_lock: Mutex::new(()),
            closing_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use a fixed seed for the simulated values.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    async fn simulate(&self, range: RangeInclusive<u32>) -> u32 {
        self.rng.lock().await.random_range(range)
    }

    async fn lock_closing(&self, closing_id: ClosingId) -> OwnedMutexGuard<()> {
        let lock = self.closing_locks.lock().await.entry(closing_id).or_default().clone();
        lock.lock_owned().await
    }

    async fn load_closing(&self, closing_id: ClosingId) -> Result<ClosingWithItems, anyhow::Error> {
        self.store
            .get_closing(closing_id)
            .await?
            .ok_or_else(|| anyhow!("closing {closing_id} not found"))
    }

    /// All closings of a period, after creating the ones missing for active clients.
    pub async fn closings_for_period(&self, period: Period) -> Result<Vec<ClosingWithItems>, anyhow::Error> {
        self.initialize_period(period).await?;
        let closings = self.store.closings_for_period(period).await.context("loading closings")?;
        Ok(closings)
    }

    /// Create a closing with its checklist for every active client that has none in the period.
    ///
    /// Closings and checklist items are inserted separately. If the item insert fails, the
    /// closings stay without checklist and the error is returned.
    ///
    /// # Returns
    ///
    /// The number of closings created.
    ///
    pub async fn initialize_period(&self, period: Period) -> Result<usize, anyhow::Error> {
        period.validate()?;
        let _init = self.init_lock.lock().await;

        let clients = self.store.active_clients().await.context("listing active clients")?;
        let existing: HashSet<ClientId> = self
            .store
            .closings_for_period(period)
            .await
            .context("loading closings")?
            .into_iter()
            .map(|c| c.closing.client_id)
            .collect();
        let missing: Vec<ClientId> = clients
            .into_iter()
            .map(|c| c.id)
            .filter(|id| !existing.contains(id))
            .collect();
        if missing.is_empty() {
            debug!(period = period.to_string(); "Every active client has a closing");
            return Ok(0);
        }

        let now = self.clock.now();
        let mut closings = Vec::with_capacity(missing.len());
        for client_id in missing {
            let documents = self.simulate(SIMULATED_DOCUMENT_COUNT).await;
            closings.push(ClosingStatus::new(client_id, period, documents, now));
        }
        let items: Vec<ChecklistItem> = closings.iter().flat_map(|c| default_checklist(c.id)).collect();
        let count = closings.len();

        self.store.insert_closings(closings).await.context("inserting closings")?;
        self.store.insert_checklist_items(items).await.context("inserting checklist items")?;

        self.audit.record(AuditEntry::new(
            now,
            AuditLevel::Info,
            AuditEvent::ClosingInitialized,
            format!("Initialized {count} closing(s) for {period}"),
        ));
        Ok(count)
    }

    /// The client's closing for the period.
    pub async fn closing_for_client(&self, client_id: &ClientId, period: Period) -> Result<ClosingWithItems, anyhow::Error> {
        period.validate()?;
        self.store
            .closing_for_client(client_id.clone(), period)
            .await?
            .ok_or_else(|| anyhow!("no closing for client {client_id} in {period}"))
    }

    /// The client's closing for the period, created on the spot if missing.
    ///
    /// A missing closing first initializes the whole period, so every active client gets its
    /// closing. A client outside the active ones gets a closing of its own.
    ///
    pub async fn ensure_closing(&self, client_id: &ClientId, period: Period) -> Result<ClosingWithItems, anyhow::Error> {
        period.validate()?;
        if let Some(record) = self.store.closing_for_client(client_id.clone(), period).await? {
            return Ok(record);
        }

        self.initialize_period(period).await?;
        let _init = self.init_lock.lock().await;
        if let Some(record) = self.store.closing_for_client(client_id.clone(), period).await? {
            return Ok(record);
        }

        let now = self.clock.now();
        let documents = self.simulate(SIMULATED_DOCUMENT_COUNT).await;
        let closing = ClosingStatus::new(client_id.clone(), period, documents, now);
        let items = default_checklist(closing.id);
        self.store.insert_closings(vec![closing.clone()]).await.context("inserting closing")?;
        self.store.insert_checklist_items(items.clone()).await.context("inserting checklist items")?;

        info!(client_id, period = period.to_string(); "Closing created");
        Ok(ClosingWithItems { closing, items })
    }

    /// Advance a client's closing by completing up to [`MAX_ITEMS_PER_STEP`] pending items.
    pub async fn intelligent_step(&self, client_id: &ClientId, period: Period) -> Result<ClosingStepReport, anyhow::Error> {
        let record = self.closing_for_client(client_id, period).await?;
        self.complete_pending(record.closing.id, |_| true, MAX_ITEMS_PER_STEP).await
    }

    /// Complete every pending item of one type in a client's closing, creating the closing if needed.
    pub async fn complete_items_of_type(
        &self,
        client_id: &ClientId,
        period: Period,
        item_type: ChecklistItemType,
    ) -> Result<ClosingStepReport, anyhow::Error> {
        let record = self.ensure_closing(client_id, period).await?;
        self.complete_pending(record.closing.id, |item| item.item_type == item_type, usize::MAX).await
    }

    async fn complete_pending<F>(
        &self,
        closing_id: ClosingId,
        select: F,
        limit: usize,
    ) -> Result<ClosingStepReport, anyhow::Error>
    where
        F: Fn(&ChecklistItem) -> bool,
    {
        let _guard = self.lock_closing(closing_id).await;
        let mut record = self.load_closing(closing_id).await?;
        if record.closing.is_blocked() {
            debug!(closing_id; "Closing is blocked, not advancing");
            return Ok(ClosingStepReport::new(&record.closing, vec![], Some("closing is blocked".to_owned())));
        }

        let chosen: Vec<ChecklistItemId> = record
            .pending_items()
            .into_iter()
            .filter(|i| select(i))
            .take(limit)
            .map(|i| i.id)
            .collect();

        let now = self.clock.now();
        let ClosingWithItems { closing, items } = &mut record;
        for item in items.iter_mut().filter(|i| chosen.contains(&i.id)) {
            let minutes = self.simulate(SIMULATED_ITEM_MINUTES).await;
            item.complete(minutes, now);
            if item.item_type == ChecklistItemType::DocumentValidation {
                closing.documents_processed = closing.documents_total;
            }
            self.store.update_checklist_item(item.clone()).await.context("updating checklist item")?;
        }

        record.closing.validations_passed = record.completed_validations();
        self.save_progress(&mut record.closing).await?;
        Ok(ClosingStepReport::new(&record.closing, chosen, None))
    }

    /// Apply the closing's validation progress to its status and store it.
    async fn save_progress(&self, closing: &mut ClosingStatus) -> Result<(), anyhow::Error> {
        let now = self.clock.now();
        let before = closing.status;
        if !closing.is_blocked() {
            closing.apply_progress(now);
        }
        closing.updated_at = now;
        self.store.update_closing(closing.clone()).await.context("updating closing")?;

        if closing.status != before {
            self.audit.record(AuditEntry::new(
                now,
                AuditLevel::Info,
                AuditEvent::ClosingAdvanced,
                format!(
                    "Closing of client {} for {} moved from {:?} to {:?}",
                    closing.client_id, closing.period, before, closing.status
                ),
            ));
        }
        if closing.status == ClosingState::Completed && before != ClosingState::Completed {
            self.notifications.publish(
                NotificationKind::Success,
                "Closing completed",
                format!("Closing for {} is complete", closing.period),
                Some(closing.client_id.clone()),
                now,
            );
        }
        Ok(())
    }

    /// Set a checklist item's status by hand.
    pub async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        status: ItemStatus,
        actual_minutes: Option<u32>,
    ) -> Result<ClosingWithItems, anyhow::Error> {
        let closing_id = self
            .store
            .get_checklist_item(item_id)
            .await?
            .ok_or_else(|| anyhow!("checklist item {item_id} not found"))?
            .closing_id;

        let _guard = self.lock_closing(closing_id).await;
        let mut record = self.load_closing(closing_id).await?;
        let item = record
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| anyhow!("checklist item {item_id} not found"))?;

        let now = self.clock.now();
        match status {
            ItemStatus::Completed => item.complete(actual_minutes.or(item.actual_minutes).unwrap_or(0), now),
            other => {
                item.status = other;
                item.completed_at = None;
                if actual_minutes.is_some() {
                    item.actual_minutes = actual_minutes;
                }
            }
        }
        self.store.update_checklist_item(item.clone()).await.context("updating checklist item")?;

        record.closing.validations_passed = record.completed_validations();
        self.save_progress(&mut record.closing).await?;
        self.load_closing(closing_id).await
    }

    /// Replace the blocking issues of a client's closing.
    ///
    /// Any issue blocks the closing. Clearing all issues resumes it: in progress if some validation
    /// passed already, pending otherwise.
    ///
    pub async fn set_blocking_issues(
        &self,
        client_id: &ClientId,
        period: Period,
        issues: Vec<String>,
    ) -> Result<ClosingStatus, anyhow::Error> {
        let closing_id = self.closing_for_client(client_id, period).await?.closing.id;
        let _guard = self.lock_closing(closing_id).await;
        let ClosingWithItems { mut closing, .. } = self.load_closing(closing_id).await?;

        closing.blocking_issues = issues;
        if !closing.blocking_issues.is_empty() {
            closing.status = ClosingState::Blocked;
        } else if closing.status == ClosingState::Blocked {
            closing.status = if closing.validations_passed > 0 {
                ClosingState::InProgress
            } else {
                ClosingState::Pending
            };
        }
        self.save_progress(&mut closing).await?;
        Ok(closing)
    }

    /// Count a manual adjustment. A completed closing goes back to review.
    pub async fn record_manual_adjustment(&self, client_id: &ClientId, period: Period) -> Result<ClosingStatus, anyhow::Error> {
        let closing_id = self.closing_for_client(client_id, period).await?.closing.id;
        let _guard = self.lock_closing(closing_id).await;
        let ClosingWithItems { mut closing, .. } = self.load_closing(closing_id).await?;

        closing.manual_adjustments_count += 1;
        if closing.status == ClosingState::Completed {
            closing.status = ClosingState::Review;
            closing.completed_at = None;
        }
        closing.updated_at = self.clock.now();
        self.store.update_closing(closing.clone()).await.context("updating closing")?;
        Ok(closing)
    }

    pub async fn period_summary(&self, period: Period) -> Result<PeriodSummary, anyhow::Error> {
        let closings = self.closings_for_period(period).await?;
        Ok(PeriodSummary::from_closings(closings.iter().map(|c| &c.closing)))
    }
}
