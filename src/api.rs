//!
//! The single request router of the server.
//!
//! Every request sent over a connection ends up in [`AppContext::handle`]. Errors never escape:
//! they are answered with [`Response::Error`] and the connection stays usable.
//!

use crate::audit::{AuditEntry, AuditEvent, AuditLevel};
use crate::closing::PeriodSummary;
use crate::context::AppContext;
use crate::exe::{cleanup_offline_workers, BatchRequest, MAX_POOL_SIZE};
use crate::messaging::{Request, Response, TaskPayload};
use crate::period::Period;
use crate::store::Store;
use anyhow::{anyhow, bail, Context};
use chrono::Duration;
use log::{debug, warn};

/// Audit entries returned when a request doesn't set a limit.
const DEFAULT_AUDIT_LIMIT: usize = 100;

impl<S: Store> AppContext<S> {
    pub async fn handle(&self, request: Request) -> Response {
        debug!(request:?; "Handling request");
        match self.route(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(e:?; "Request failed");
                Response::Error { message: format!("{e:#}") }
            }
        }
    }

    async fn route(&self, request: Request) -> Result<Response, anyhow::Error> {
        let response = match request {
            Request::StartBatch { batch_id, client_ids, month, year, max_concurrency, priority } => {
                let request = BatchRequest {
                    batch_id: batch_id.unwrap_or_default(),
                    client_ids,
                    period: Period::new(month, year)?,
                    max_concurrency: self.concurrency(max_concurrency)?,
                    priority: priority.unwrap_or(self.options.batch_priority()),
                };
                let running = self.begin_batch(request.batch_id)?;
                let report = self.batches.run(request, running.token()).await?;
                Response::Batch(report)
            }

            Request::CancelBatch { batch_id } => {
                Response::BatchCancelled { batch_id, found: self.cancel_batch(batch_id) }
            }

            Request::ProcessQueue { max_tasks, max_concurrency } => {
                let max_concurrency = self.concurrency(max_concurrency)?;
                let report = self.batches.drain(max_tasks, max_concurrency, self.shutdown_token().child_token()).await?;
                Response::Batch(report)
            }

            Request::EnqueueTask(task) => {
                TaskPayload::decode(task.task_type, &task.parameters)?;
                let now = self.clock.now();
                let task = self.store.enqueue(task, now).await.context("enqueuing task")?;
                self.audit.record(
                    AuditEntry::new(
                        now,
                        AuditLevel::Info,
                        AuditEvent::TaskEnqueued,
                        format!("{} task enqueued with priority {}", task.task_type, task.priority),
                    )
                    .task(task.id),
                );
                Response::TaskEnqueued { task_id: task.id }
            }

            Request::GetTask { task_id } => Response::Task(self.store.get_task(task_id).await?),

            Request::QueueStats => Response::QueueStats(self.store.queue_stats(self.clock.now()).await?),

            Request::ListWorkers => {
                let workers = self.store.list_workers().await?;
                match self.clock.now().checked_sub_signed(self.options.worker_offline_after()) {
                    Some(cutoff) => Response::Workers(workers.into_iter().map(|w| w.seen_since(cutoff)).collect()),
                    None => Response::Workers(workers),
                }
            }

            Request::CleanupWorkers { offline_after_secs } => {
                let offline_after = match offline_after_secs {
                    Some(secs) => i64::try_from(secs)
                        .ok()
                        .and_then(Duration::try_seconds)
                        .ok_or_else(|| anyhow!("offline_after_secs {secs} is out of range"))?,
                    None => self.options.worker_offline_after(),
                };
                let removed = cleanup_offline_workers(&self.store, self.clock.as_ref(), &self.audit, offline_after).await?;
                Response::WorkersCleanedUp { removed: removed.into_iter().map(|w| w.worker_id).collect() }
            }

            Request::ClosingOverview { month, year } => {
                let closings = self.tracker.closings_for_period(Period::new(month, year)?).await?;
                let summary = PeriodSummary::from_closings(closings.iter().map(|c| &c.closing));
                Response::ClosingOverview { summary, closings }
            }

            Request::IntelligentClosing { client_id, month, year } => {
                let report = self.tracker.intelligent_step(&client_id, Period::new(month, year)?).await?;
                Response::ClosingStep(report)
            }

            Request::UpdateChecklistItem { item_id, status, actual_minutes } => {
                Response::Closing(self.tracker.update_checklist_item(item_id, status, actual_minutes).await?)
            }

            Request::SetBlockingIssues { client_id, month, year, issues } => {
                let closing = self
                    .tracker
                    .set_blocking_issues(&client_id, Period::new(month, year)?, issues)
                    .await?;
                Response::ClosingStatus(closing)
            }

            Request::RecordAdjustment { client_id, month, year } => {
                let closing = self.tracker.record_manual_adjustment(&client_id, Period::new(month, year)?).await?;
                Response::ClosingStatus(closing)
            }

            Request::RegisterClient(client) => {
                let client_id = client.id.clone();
                self.store.upsert_client(client).await.context("registering client")?;
                Response::ClientRegistered { client_id }
            }

            Request::RecordPayment(payment) => {
                let payment_id = payment.id;
                self.store.record_payment(payment).await.context("recording payment")?;
                Response::PaymentRecorded { payment_id }
            }

            Request::CheckOverduePayments { today } => {
                let today = today.unwrap_or_else(|| self.clock.now().date_naive());
                self.payments.check_overdue_payments(today).await?;
                Response::PaymentAlerts(self.payments.state().await)
            }

            Request::Notifications { unread_only } => Response::Notifications {
                unread: self.notifications.unread_count(),
                notifications: self.notifications.list(unread_only),
            },

            Request::MarkNotificationRead { notification_id } => {
                let marked = match notification_id {
                    Some(id) => usize::from(self.notifications.mark_read(id)),
                    None => self.notifications.mark_all_read(),
                };
                Response::NotificationsRead { marked }
            }

            Request::AuditTrail { limit } => {
                Response::AuditTrail(self.audit.recent(limit.unwrap_or(DEFAULT_AUDIT_LIMIT)))
            }
        };
        Ok(response)
    }

    /// Worker count for a batch or drain: the requested one, or the configured default.
    fn concurrency(&self, requested: Option<usize>) -> Result<usize, anyhow::Error> {
        match requested {
            Some(n) if n > MAX_POOL_SIZE => bail!("max_concurrency {n} exceeds {MAX_POOL_SIZE}"),
            Some(n) => Ok(n.max(1)),
            None => Ok(self.options.max_concurrency()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use crate::clock::{Clock, ManualClock};
    use crate::closing::ClosingState;
    use crate::messaging::{BatchId, NewTask, TaskKind, WorkerId};
    use crate::options::ContaflixOptions;
    use crate::payments::{Payment, PaymentStatus};
    use crate::store::{InMemoryStore, StoreOp, WorkerInstance, WorkerStatus, WorkerStore};
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn context(clients: usize) -> AppContext<InMemoryStore> {
        let store = InMemoryStore::new();
        let options = ContaflixOptions {
            simulation_seed: Some(11),
            busy_poll_ms: Some(5),
            idle_poll_ms: Some(5),
            ..ContaflixOptions::default()
        };
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 10, 12, 0, 0).unwrap()));
        let context = AppContext::new(store, options, clock, CancellationToken::new());
        for n in 0..clients {
            context
                .handle(Request::RegisterClient(Client::new(format!("c-{n}"), format!("Client {n}"))))
                .await;
        }
        context
    }

    #[tokio::test]
    async fn batch_request_runs_closings_for_all_clients() {
        let context = context(3).await;

        let response = context
            .handle(Request::StartBatch {
                batch_id: None,
                client_ids: None,
                month: 1,
                year: 2025,
                max_concurrency: Some(2),
                priority: None,
            })
            .await;
        let Response::Batch(report) = response else {
            panic!("unexpected response {response:?}");
        };
        assert_eq!(report.enqueued, 3);
        assert_eq!(report.completed, 3);
        assert!(context.running_batches().is_empty());

        let response = context.handle(Request::ClosingOverview { month: 1, year: 2025 }).await;
        let Response::ClosingOverview { summary, closings } = response else {
            panic!("unexpected response {response:?}");
        };
        assert_eq!(summary.total, 3);
        assert!(closings.iter().all(|c| c.closing.validations_passed == 3));
    }

    #[tokio::test]
    async fn invalid_period_is_answered_with_an_error() {
        let context = context(0).await;

        let response = context.handle(Request::ClosingOverview { month: 13, year: 2025 }).await;
        assert_eq!(response, Response::Error { message: "invalid month 13 (expected 1-12)".to_owned() });
    }

    #[tokio::test]
    async fn enqueue_rejects_undecodable_parameters() -> Result<(), anyhow::Error> {
        let context = context(0).await;
        let task = NewTask {
            task_type: TaskKind::ReportGeneration,
            client_id: None,
            priority: 1,
            parameters: json!({ "period": { "year": 2025, "month": 1 } }),
            max_retries: 3,
            scheduled_at: None,
        };

        let response = context.handle(Request::EnqueueTask(task)).await;
        assert!(matches!(response, Response::Error { .. }));

        let response = context.handle(Request::QueueStats).await;
        assert!(matches!(response, Response::QueueStats(stats) if stats.total() == 0));
        Ok(())
    }

    #[tokio::test]
    async fn closing_can_be_blocked_and_stepped() -> Result<(), anyhow::Error> {
        let context = context(1).await;
        context.handle(Request::ClosingOverview { month: 1, year: 2025 }).await;

        let response = context
            .handle(Request::SetBlockingIssues {
                client_id: "c-0".into(),
                month: 1,
                year: 2025,
                issues: vec!["missing invoices".to_owned()],
            })
            .await;
        assert!(matches!(response, Response::ClosingStatus(ref c) if c.status == ClosingState::Blocked));

        let response = context
            .handle(Request::IntelligentClosing { client_id: "c-0".into(), month: 1, year: 2025 })
            .await;
        let Response::ClosingStep(report) = response else {
            panic!("unexpected response {response:?}");
        };
        assert!(report.items_completed.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_payment_check_notifies_and_keeps_loading_off() -> Result<(), anyhow::Error> {
        let context = context(0).await;
        context
            .handle(Request::RecordPayment(Payment {
                id: Default::default(),
                client_id: "c-0".into(),
                description: "ISS".to_owned(),
                amount_cents: 9_900,
                due_date: NaiveDate::from_ymd_opt(2025, 1, 20).ok_or(anyhow::anyhow!("bad date"))?,
                status: PaymentStatus::Pending,
            }))
            .await;

        let response = context.handle(Request::CheckOverduePayments { today: None }).await;
        let Response::PaymentAlerts(state) = response else {
            panic!("unexpected response {response:?}");
        };
        assert_eq!(state.alerts.len(), 1);
        assert_eq!(state.alerts[0].days_overdue, 21);

        context.store.inject_failure(StoreOp::OverduePayments, 1).await;
        let response = context.handle(Request::CheckOverduePayments { today: None }).await;
        assert!(matches!(response, Response::Error { .. }));

        let state = context.payments.state().await;
        assert!(!state.is_loading);
        assert_eq!(state.alerts.len(), 1);

        let response = context.handle(Request::Notifications { unread_only: true }).await;
        let Response::Notifications { unread, notifications } = response else {
            panic!("unexpected response {response:?}");
        };
        assert_eq!(unread, 2);
        assert_eq!(notifications[0].title, "Error checking payments");

        let response = context.handle(Request::MarkNotificationRead { notification_id: None }).await;
        assert_eq!(response, Response::NotificationsRead { marked: 2 });
        Ok(())
    }

    #[tokio::test]
    async fn cancelling_an_unknown_batch_reports_not_found() {
        let context = context(0).await;
        let batch_id = BatchId::new();

        let response = context.handle(Request::CancelBatch { batch_id }).await;
        assert_eq!(response, Response::BatchCancelled { batch_id, found: false });
    }

    #[tokio::test]
    async fn silent_workers_are_listed_as_offline() -> Result<(), anyhow::Error> {
        let store = InMemoryStore::new();
        let start = Utc.with_ymd_and_hms(2025, 2, 10, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let options = ContaflixOptions { worker_offline_secs: Some(60), ..ContaflixOptions::default() };
        let context = AppContext::new(store.clone(), options, clock.clone(), CancellationToken::new());

        let quiet = WorkerInstance::new("batch", 2, start);
        let busy = WorkerInstance::new("batch", 2, start);
        store.register_worker(quiet.clone()).await?;
        store.register_worker(busy.clone()).await?;

        clock.advance(chrono::Duration::seconds(90));
        store.heartbeat(busy.worker_id.clone(), 1, clock.now()).await?;

        let response = context.handle(Request::ListWorkers).await;
        let Response::Workers(workers) = response else {
            panic!("unexpected response {response:?}");
        };
        let status_of = |id: &WorkerId| workers.iter().find(|w| &w.worker_id == id).map(|w| w.status);
        assert_eq!(status_of(&quiet.worker_id), Some(WorkerStatus::Offline));
        assert_eq!(status_of(&busy.worker_id), Some(WorkerStatus::Active));
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_values_are_answered_with_errors() {
        let context = context(1).await;

        for secs in [1_000_000_000_000_000, 100_000_000_000_000_000, u64::MAX] {
            let response = context.handle(Request::CleanupWorkers { offline_after_secs: Some(secs) }).await;
            assert!(matches!(response, Response::Error { ref message } if message.contains("out of range")));
        }

        let response = context
            .handle(Request::StartBatch {
                batch_id: None,
                client_ids: None,
                month: 1,
                year: 2025,
                max_concurrency: Some(usize::MAX),
                priority: None,
            })
            .await;
        assert_eq!(response, Response::Error { message: format!("max_concurrency {} exceeds 1024", usize::MAX) });

        let response = context
            .handle(Request::ProcessQueue { max_tasks: None, max_concurrency: Some(MAX_POOL_SIZE + 1) })
            .await;
        assert_eq!(response, Response::Error { message: "max_concurrency 1025 exceeds 1024".to_owned() });

        // The context keeps serving requests.
        let response = context.handle(Request::CleanupWorkers { offline_after_secs: Some(60) }).await;
        assert_eq!(response, Response::WorkersCleanedUp { removed: vec![] });
    }
}
