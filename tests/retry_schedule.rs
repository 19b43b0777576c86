use chrono::{Duration, TimeZone, Utc};
use contaflix::clock::{Clock, ManualClock};
use contaflix::context::AppContext;
use contaflix::messaging::{NewTask, Request, Response, TaskPayload, TaskStatus};
use contaflix::options::ContaflixOptions;
use contaflix::period::Period;
use contaflix::store::{InMemoryStore, StoreOp};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn context(store: &InMemoryStore, clock: &Arc<ManualClock>) -> AppContext<InMemoryStore> {
    let options = ContaflixOptions {
        idle_poll_ms: Some(5),
        busy_poll_ms: Some(5),
        simulation_seed: Some(11),
        ..ContaflixOptions::default()
    };
    let clock: Arc<dyn Clock> = clock.clone();
    AppContext::new(store.clone(), options, clock, CancellationToken::new())
}

async fn drain(context: &AppContext<InMemoryStore>) -> (usize, usize, usize) {
    let response = context.handle(Request::ProcessQueue { max_tasks: None, max_concurrency: Some(2) }).await;
    let Response::Batch(report) = response else {
        panic!("unexpected response {response:?}");
    };
    (report.dispatched, report.completed, report.retried)
}

#[tokio::test]
async fn task_failing_twice_completes_on_its_third_attempt() -> Result<(), anyhow::Error> {
    let store = InMemoryStore::new();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap()));
    let context = context(&store, &clock);

    let payload = TaskPayload::MonthlyClosing { period: Period::new(3, 2025)?, batch_id: None };
    let task = NewTask::new(Some("acme".into()), &payload)?.with_max_retries(3);
    let Response::TaskEnqueued { task_id } = context.handle(Request::EnqueueTask(task)).await else {
        panic!("task not enqueued");
    };

    // Creating the closing fails on the first two attempts.
    store.inject_failure(StoreOp::InsertClosings, 2).await;

    assert_eq!(drain(&context).await, (1, 0, 1));

    // Not due before its backoff elapsed.
    assert_eq!(drain(&context).await, (0, 0, 0));
    clock.advance(Duration::minutes(5));
    assert_eq!(drain(&context).await, (1, 0, 1));

    clock.advance(Duration::minutes(5));
    assert_eq!(drain(&context).await, (0, 0, 0));
    clock.advance(Duration::minutes(5));
    assert_eq!(drain(&context).await, (1, 1, 0));

    let Response::Task(Some(task)) = context.handle(Request::GetTask { task_id }).await else {
        panic!("task not found");
    };
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    assert!(task.result.is_some());
    Ok(())
}

#[tokio::test]
async fn exhausted_task_stays_failed() -> Result<(), anyhow::Error> {
    let store = InMemoryStore::new();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).unwrap()));
    let context = context(&store, &clock);

    let payload = TaskPayload::MonthlyClosing { period: Period::new(3, 2025)?, batch_id: None };
    let task = NewTask::new(Some("acme".into()), &payload)?.with_max_retries(2);
    let Response::TaskEnqueued { task_id } = context.handle(Request::EnqueueTask(task)).await else {
        panic!("task not enqueued");
    };
    store.inject_failure(StoreOp::InsertClosings, 5).await;

    assert_eq!(drain(&context).await, (1, 0, 1));
    clock.advance(Duration::minutes(5));
    assert_eq!(drain(&context).await, (1, 0, 0));

    // Nothing is claimed anymore, however late it gets.
    clock.advance(Duration::days(1));
    assert_eq!(drain(&context).await, (0, 0, 0));

    let Response::Task(Some(task)) = context.handle(Request::GetTask { task_id }).await else {
        panic!("task not found");
    };
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.error_details.is_some_and(|e| e.contains("injected failure")));

    let Response::Notifications { unread, .. } = context.handle(Request::Notifications { unread_only: true }).await
    else {
        panic!("notifications not listed");
    };
    assert_eq!(unread, 1);
    Ok(())
}
