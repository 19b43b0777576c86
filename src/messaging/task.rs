use crate::messaging::{BatchId, ClientId, TaskId, WorkerId};
use crate::period::Period;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::{Display, Formatter};

/// Priority given to tasks when the submitter doesn't pick one. Lower is more urgent.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Number of attempts a task gets before it is failed for good.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    MonthlyClosing,
    IntelligentClosing,
    DocumentValidation,
    ReportGeneration,
    ComplianceCheck,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::MonthlyClosing => "monthly_closing",
            TaskKind::IntelligentClosing => "intelligent_closing",
            TaskKind::DocumentValidation => "document_validation",
            TaskKind::ReportGeneration => "report_generation",
            TaskKind::ComplianceCheck => "compliance_check",
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Typed parameters of a task, keyed by its task type.
///
/// Tasks are stored with their parameters as plain JSON. The payload is decoded, and validated,
/// only when a dispatcher is about to execute the task.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "parameters", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Close one client's books for a period. Enqueued in bulk by the batch orchestrator.
    MonthlyClosing {
        period: Period,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<BatchId>,
    },
    IntelligentClosing { period: Period },
    DocumentValidation {
        period: Period,
        #[serde(default)]
        document_ids: Vec<String>,
    },
    ReportGeneration { period: Period, report_type: String },
    ComplianceCheck { period: Period },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::MonthlyClosing { .. } => TaskKind::MonthlyClosing,
            TaskPayload::IntelligentClosing { .. } => TaskKind::IntelligentClosing,
            TaskPayload::DocumentValidation { .. } => TaskKind::DocumentValidation,
            TaskPayload::ReportGeneration { .. } => TaskKind::ReportGeneration,
            TaskPayload::ComplianceCheck { .. } => TaskKind::ComplianceCheck,
        }
    }

    pub fn period(&self) -> Period {
        match self {
            TaskPayload::MonthlyClosing { period, .. }
            | TaskPayload::IntelligentClosing { period }
            | TaskPayload::DocumentValidation { period, .. }
            | TaskPayload::ReportGeneration { period, .. }
            | TaskPayload::ComplianceCheck { period } => *period,
        }
    }

    /// Decode the stored parameters of a task of the given kind.
    pub fn decode(kind: TaskKind, parameters: &serde_json::Value) -> Result<Self, anyhow::Error> {
        let tagged = json!({ "task_type": kind, "parameters": parameters });
        let payload: Self = serde_json::from_value(tagged)
            .with_context(|| format!("decoding parameters of {kind} task"))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Split the payload into its task type and the JSON parameters to store.
    pub fn encode(&self) -> Result<(TaskKind, serde_json::Value), anyhow::Error> {
        let mut tagged = serde_json::to_value(self).context("encoding task payload")?;
        let parameters = tagged
            .get_mut("parameters")
            .map(serde_json::Value::take)
            .ok_or(anyhow!("encoded payload has no parameters"))?;
        Ok((self.kind(), parameters))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.period().validate()?;
        if let TaskPayload::ReportGeneration { report_type, .. } = self {
            if report_type.trim().is_empty() {
                return Err(anyhow!("report_type must not be empty"));
            }
        }
        Ok(())
    }
}

/// A row of the processing queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: TaskId,
    pub task_type: TaskKind,
    pub client_id: Option<ClientId>,

    /// Lower values are claimed first.
    pub priority: i32,
    pub status: TaskStatus,

    /// Stored parameters. See [`TaskPayload::decode`].
    pub parameters: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,

    /// The task isn't claimable before this time. Pushed forward on every retry.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,

    /// End of the current claim's lease. Set when claimed.
    pub timeout_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_details: Option<String>,

    /// The worker holding the claim, or the last one that held it.
    pub worker_id: Option<WorkerId>,
}

impl QueueTask {
    pub fn from_new(task: NewTask, now: DateTime<Utc>) -> Self {
        let NewTask { task_type, client_id, priority, parameters, max_retries, scheduled_at } = task;
        Self {
            id: TaskId::new(),
            task_type,
            client_id,
            priority,
            status: TaskStatus::Pending,
            parameters,
            retry_count: 0,
            max_retries,
            created_at: now,
            scheduled_at: scheduled_at.unwrap_or(now),
            started_at: None,
            timeout_at: None,
            completed_at: None,
            result: None,
            error_details: None,
            worker_id: None,
        }
    }

    /// Whether the task can be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_at <= now
            && self.retry_count < self.max_retries
    }

    pub fn payload(&self) -> Result<TaskPayload, anyhow::Error> {
        TaskPayload::decode(self.task_type, &self.parameters)
    }
}

/// A task to be inserted into the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskKind,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NewTask {
    pub fn new(client_id: Option<ClientId>, payload: &TaskPayload) -> Result<Self, anyhow::Error> {
        payload.validate()?;
        let (task_type, parameters) = payload.encode()?;
        Ok(Self {
            task_type,
            client_id,
            priority: DEFAULT_PRIORITY,
            parameters,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_at: None,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}
