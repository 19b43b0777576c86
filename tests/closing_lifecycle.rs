use chrono::{TimeZone, Utc};
use contaflix::audit::{AuditEvent, AuditLog};
use contaflix::clients::Client;
use contaflix::clock::ManualClock;
use contaflix::closing::{ClosingState, ClosingTracker};
use contaflix::messaging::ClientId;
use contaflix::notifications::{NotificationCenter, NotificationKind};
use contaflix::period::Period;
use contaflix::store::{ClosingStore, InMemoryStore, SeedData, StoreOp};
use std::sync::Arc;

struct Office {
    store: InMemoryStore,
    audit: Arc<AuditLog>,
    notifications: Arc<NotificationCenter>,
    tracker: ClosingTracker<InMemoryStore>,
}

async fn office(clients: Vec<Client>) -> Office {
    let store = InMemoryStore::new();
    store.seed(SeedData { clients, payments: vec![] }).await;

    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).unwrap()));
    let audit = Arc::new(AuditLog::new(100));
    let notifications = Arc::new(NotificationCenter::new(100));
    let tracker = ClosingTracker::new(store.clone(), clock, audit.clone(), notifications.clone()).with_seed(7);
    Office { store, audit, notifications, tracker }
}

fn client(id: &str, active: bool) -> Client {
    Client { active, ..Client::new(id, format!("Client {id}")) }
}

#[tokio::test]
async fn overview_initializes_every_active_client_once() -> Result<(), anyhow::Error> {
    let office = office(vec![client("a", true), client("b", true), client("c", true), client("d", false)]).await;
    let period = Period::new(3, 2025)?;

    let closings = office.tracker.closings_for_period(period).await?;
    assert_eq!(closings.len(), 3);
    assert!(closings.iter().all(|c| c.items.len() == 5));
    assert!(closings.iter().all(|c| c.closing.status == ClosingState::Pending));
    assert_eq!(office.store.checklist_item_count().await, 15);

    // A second look reuses the existing closings.
    let again = office.tracker.closings_for_period(period).await?;
    assert_eq!(again.len(), 3);
    assert_eq!(office.store.checklist_item_count().await, 15);
    assert_eq!(office.audit.count(AuditEvent::ClosingInitialized), 1);
    Ok(())
}

#[tokio::test]
async fn failed_checklist_insert_leaves_closings_without_items() -> Result<(), anyhow::Error> {
    let office = office(vec![client("a", true), client("b", true)]).await;
    let period = Period::new(3, 2025)?;
    office.store.inject_failure(StoreOp::InsertChecklistItems, 1).await;

    let err = office.tracker.initialize_period(period).await.unwrap_err();
    assert!(format!("{err:#}").contains("inserting checklist items"));

    let closings = office.store.closings_for_period(period).await?;
    assert_eq!(closings.len(), 2);
    assert!(closings.iter().all(|c| c.items.is_empty()));
    assert_eq!(office.audit.count(AuditEvent::ClosingInitialized), 0);
    Ok(())
}

#[tokio::test]
async fn two_intelligent_steps_complete_a_closing() -> Result<(), anyhow::Error> {
    let office = office(vec![client("a", true)]).await;
    let period = Period::new(3, 2025)?;
    let client_id = ClientId::from("a");
    office.tracker.closings_for_period(period).await?;

    let first = office.tracker.intelligent_step(&client_id, period).await?;
    assert_eq!(first.items_completed.len(), 3);
    assert_eq!(first.validations_passed, 3);
    assert_eq!(first.status, ClosingState::Pending);

    let second = office.tracker.intelligent_step(&client_id, period).await?;
    assert_eq!(second.items_completed.len(), 2);
    assert_eq!(second.validations_passed, 5);
    assert_eq!(second.status, ClosingState::Completed);

    let third = office.tracker.intelligent_step(&client_id, period).await?;
    assert_eq!(third.items_completed.len(), 0);
    assert_eq!(third.status, ClosingState::Completed);

    let record = office.tracker.closing_for_client(&client_id, period).await?;
    assert!(record.closing.completed_at.is_some());
    assert_eq!(record.closing.documents_processed, record.closing.documents_total);
    assert!((record.closing.confidence_score - 1.0).abs() < f64::EPSILON);

    let successes = office
        .notifications
        .list(false)
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Success)
        .count();
    assert_eq!(successes, 1);
    Ok(())
}

#[tokio::test]
async fn blocked_closing_is_not_advanced_until_cleared() -> Result<(), anyhow::Error> {
    let office = office(vec![client("a", true)]).await;
    let period = Period::new(3, 2025)?;
    let client_id = ClientId::from("a");
    office.tracker.closings_for_period(period).await?;

    let blocked = office
        .tracker
        .set_blocking_issues(&client_id, period, vec!["missing bank statement".to_owned()])
        .await?;
    assert_eq!(blocked.status, ClosingState::Blocked);

    let step = office.tracker.intelligent_step(&client_id, period).await?;
    assert_eq!(step.items_completed.len(), 0);
    assert!(step.skipped.is_some());

    let cleared = office.tracker.set_blocking_issues(&client_id, period, vec![]).await?;
    assert_eq!(cleared.status, ClosingState::Pending);

    let step = office.tracker.intelligent_step(&client_id, period).await?;
    assert_eq!(step.items_completed.len(), 3);
    Ok(())
}

#[tokio::test]
async fn stepping_an_unknown_client_fails() -> Result<(), anyhow::Error> {
    let office = office(vec![]).await;
    let period = Period::new(3, 2025)?;

    let err = office.tracker.intelligent_step(&ClientId::from("ghost"), period).await.unwrap_err();
    assert_eq!(err.to_string(), "no closing for client ghost in 2025-03");
    Ok(())
}
