use crate::messaging::{ChecklistItemId, ClientId, ClosingId};
use crate::period::Period;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingState {
    Pending,
    InProgress,
    Review,
    Completed,
    Blocked,
}

/// Monthly closing of one client for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingStatus {
    pub id: ClosingId,
    pub client_id: ClientId,
    pub period: Period,
    pub status: ClosingState,
    pub documents_processed: u32,
    pub documents_total: u32,
    pub validations_passed: u32,
    pub validations_total: u32,
    pub blocking_issues: Vec<String>,

    /// Share of validations passed, between 0.0 and 1.0.
    pub confidence_score: f64,
    pub manual_adjustments_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ClosingStatus {
    pub fn new(client_id: ClientId, period: Period, documents_total: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: ClosingId::new(),
            client_id,
            period,
            status: ClosingState::Pending,
            documents_processed: 0,
            documents_total,
            validations_passed: 0,
            validations_total: DEFAULT_CHECKLIST.len() as u32,
            blocking_issues: vec![],
            confidence_score: 0.0,
            manual_adjustments_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.status == ClosingState::Blocked || !self.blocking_issues.is_empty()
    }

    pub fn progress(&self) -> f64 {
        if self.validations_total == 0 {
            1.0
        } else {
            f64::from(self.validations_passed) / f64::from(self.validations_total)
        }
    }

    /// Move the closing forward according to its validation progress.
    ///
    /// All validations passed completes the closing; 80% or more puts it in progress. Nothing
    /// else changes the status, and a closing never moves backwards here.
    ///
    pub fn apply_progress(&mut self, now: DateTime<Utc>) {
        self.confidence_score = self.progress();
        if self.validations_passed >= self.validations_total {
            if self.status != ClosingState::Completed {
                self.status = ClosingState::Completed;
                self.completed_at = Some(now);
            }
        } else if self.validations_passed * 5 >= self.validations_total * 4
            && matches!(self.status, ClosingState::Pending)
        {
            self.status = ClosingState::InProgress;
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistItemType {
    DocumentValidation,
    Reconciliation,
    ReportGeneration,
    ComplianceCheck,
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: ChecklistItemId,
    pub closing_id: ClosingId,
    pub item_type: ChecklistItemType,
    pub title: String,
    pub status: ItemStatus,

    /// 1 (highest) to 3.
    pub priority: u8,
    pub estimated_minutes: u32,
    pub actual_minutes: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChecklistItem {
    pub fn complete(&mut self, actual_minutes: u32, now: DateTime<Utc>) {
        self.status = ItemStatus::Completed;
        self.actual_minutes = Some(actual_minutes);
        self.completed_at = Some(now);
    }
}

/// Items seeded into every new closing: (type, title, priority, estimated minutes).
pub const DEFAULT_CHECKLIST: [(ChecklistItemType, &str, u8, u32); 5] = [
    (ChecklistItemType::DocumentValidation, "Validate received documents", 1, 30),
    (ChecklistItemType::Reconciliation, "Bank reconciliation", 1, 45),
    (ChecklistItemType::Reconciliation, "Tax reconciliation", 2, 30),
    (ChecklistItemType::ReportGeneration, "Generate monthly reports", 2, 20),
    (ChecklistItemType::ComplianceCheck, "Compliance check", 3, 15),
];

pub fn default_checklist(closing_id: ClosingId) -> Vec<ChecklistItem> {
    DEFAULT_CHECKLIST
        .iter()
        .map(|(item_type, title, priority, estimated_minutes)| ChecklistItem {
            id: ChecklistItemId::new(),
            closing_id,
            item_type: *item_type,
            title: (*title).to_owned(),
            status: ItemStatus::Pending,
            priority: *priority,
            estimated_minutes: *estimated_minutes,
            actual_minutes: None,
            completed_at: None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingWithItems {
    pub closing: ClosingStatus,
    pub items: Vec<ChecklistItem>,
}

impl ClosingWithItems {
    /// Pending items, most urgent first.
    pub fn pending_items(&self) -> Vec<&ChecklistItem> {
        let mut pending: Vec<&ChecklistItem> =
            self.items.iter().filter(|i| i.status == ItemStatus::Pending).collect();
        pending.sort_by_key(|i| i.priority);
        pending
    }

    /// Validations passed according to the checklist: one per completed item.
    pub fn completed_validations(&self) -> u32 {
        let completed = self.items.iter().filter(|i| i.status == ItemStatus::Completed).count();
        u32::try_from(completed).unwrap_or(u32::MAX).min(self.closing.validations_total)
    }
}

/// Aggregate view of all closings of a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub review: usize,
    pub completed: usize,
    pub blocked: usize,
    pub completion_rate: f64,
    pub average_confidence: f64,
    pub blocking_issues: usize,
}

impl PeriodSummary {
    pub fn from_closings<'a, I>(closings: I) -> Self
    where
        I: IntoIterator<Item = &'a ClosingStatus>,
    {
        let mut summary = Self::default();
        let mut confidence = 0.0;
        for closing in closings {
            summary.total += 1;
            confidence += closing.confidence_score;
            summary.blocking_issues += closing.blocking_issues.len();
            match closing.status {
                ClosingState::Pending => summary.pending += 1,
                ClosingState::InProgress => summary.in_progress += 1,
                ClosingState::Review => summary.review += 1,
                ClosingState::Completed => summary.completed += 1,
                ClosingState::Blocked => summary.blocked += 1,
            }
        }
        if summary.total > 0 {
            summary.completion_rate = summary.completed as f64 / summary.total as f64;
            summary.average_confidence = confidence / summary.total as f64;
        }
        summary
    }
}
