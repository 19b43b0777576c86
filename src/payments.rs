//!
//! Overdue payment monitoring.
//!
//! The monitor keeps the last computed set of alerts together with a loading flag, the same state
//! a dashboard polls. A failed check leaves the previous alerts in place and raises a destructive
//! notification instead.
//!

use crate::clock::Clock;
use crate::messaging::{ClientId, PaymentId};
use crate::notifications::{NotificationCenter, NotificationKind};
use crate::store::PaymentStore;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

/// A scheduled payment (tax guide, fee, ...) owed by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    #[serde(default)]
    pub id: PaymentId,
    pub client_id: ClientId,
    pub description: String,
    pub amount_cents: i64,
    pub due_date: NaiveDate,
    pub status: PaymentStatus,
}

impl Payment {
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status != PaymentStatus::Paid && self.due_date < today
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    pub fn for_days_overdue(days: i64) -> Self {
        match days {
            d if d >= 30 => AlertSeverity::High,
            d if d >= 7 => AlertSeverity::Medium,
            _ => AlertSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAlert {
    pub payment_id: PaymentId,
    pub client_id: ClientId,
    pub description: String,
    pub amount_cents: i64,
    pub due_date: NaiveDate,
    pub days_overdue: i64,
    pub severity: AlertSeverity,
}

impl PaymentAlert {
    pub fn new(payment: &Payment, today: NaiveDate) -> Self {
        let days_overdue = (today - payment.due_date).num_days();
        Self {
            payment_id: payment.id,
            client_id: payment.client_id.clone(),
            description: payment.description.clone(),
            amount_cents: payment.amount_cents,
            due_date: payment.due_date,
            days_overdue,
            severity: AlertSeverity::for_days_overdue(days_overdue),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    pub is_loading: bool,
    pub alerts: Vec<PaymentAlert>,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct PaymentMonitor<S> {
    store: S,
    clock: Arc<dyn Clock>,
    notifications: Arc<NotificationCenter>,
    state: Mutex<MonitorState>,
}

impl<S> PaymentMonitor<S>
where
    S: PaymentStore + Send + Sync,
{
    pub fn new(store: S, clock: Arc<dyn Clock>, notifications: Arc<NotificationCenter>) -> Self {
        Self { store, clock, notifications, state: Mutex::new(MonitorState::default()) }
    }

    pub async fn state(&self) -> MonitorState {
        self.state.lock().await.clone()
    }

    /// Recompute overdue payment alerts as of `today`.
    ///
    /// # Returns
    ///
    /// The new alerts, most overdue first. On failure the error is returned after the user has
    /// been notified, and the previously computed alerts are kept.
    ///
    pub async fn check_overdue_payments(&self, today: NaiveDate) -> Result<Vec<PaymentAlert>, anyhow::Error> {
        self.state.lock().await.is_loading = true;

        let result = self.store.overdue_payments(today).await;
        let now = self.clock.now();

        let mut state = self.state.lock().await;
        state.is_loading = false;

        let payments = match result {
            Ok(payments) => payments,
            Err(e) => {
                warn!(e:?; "Checking overdue payments failed");
                self.notifications.publish(
                    NotificationKind::Destructive,
                    "Error checking payments",
                    "Overdue payments could not be checked. Try again later.",
                    None,
                    now,
                );
                return Err(e).context("checking overdue payments");
            }
        };

        let mut alerts: Vec<PaymentAlert> = payments
            .iter()
            .filter(|p| p.is_overdue(today))
            .map(|p| PaymentAlert::new(p, today))
            .collect();
        alerts.sort_by(|a, b| b.days_overdue.cmp(&a.days_overdue));

        info!(count = alerts.len(); "Overdue payments checked");
        if !alerts.is_empty() {
            self.notifications.publish(
                NotificationKind::Warning,
                "Overdue payments",
                format!("{} payment(s) are overdue", alerts.len()),
                None,
                now,
            );
        }

        state.alerts = alerts.clone();
        state.last_checked = Some(now);
        Ok(alerts)
    }
}
