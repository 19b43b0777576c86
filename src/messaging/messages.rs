use crate::audit::AuditEntry;
use crate::clients::Client;
use crate::closing::{ClosingStatus, ClosingStepReport, ClosingWithItems, ItemStatus, PeriodSummary};
use crate::exe::BatchReport;
use crate::messaging::{
    BatchId, ChecklistItemId, ClientId, NewTask, NotificationId, PaymentId, QueueTask, TaskId, WorkerId,
};
use crate::notifications::Notification;
use crate::payments::{MonitorState, Payment};
use crate::store::{QueueStats, WorkerInstance};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A request made from a TCP client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Enqueue a monthly closing task per client and process the queue until nothing is left to
    /// claim. Answered with the batch report once the batch is over.
    StartBatch {
        /// Lets the caller cancel the batch from another connection.
        #[serde(default)]
        batch_id: Option<BatchId>,

        /// All active clients when omitted.
        #[serde(default)]
        client_ids: Option<Vec<ClientId>>,
        month: u32,
        year: i32,
        #[serde(default)]
        max_concurrency: Option<usize>,
        #[serde(default)]
        priority: Option<i32>,
    },

    CancelBatch { batch_id: BatchId },

    /// Process whatever is due in the queue, without enqueuing anything.
    ProcessQueue {
        #[serde(default)]
        max_tasks: Option<usize>,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },

    EnqueueTask(NewTask),

    GetTask { task_id: TaskId },

    QueueStats,

    ListWorkers,

    /// Remove workers without a heartbeat for the given time, or the configured threshold.
    CleanupWorkers {
        #[serde(default)]
        offline_after_secs: Option<u64>,
    },

    /// All closings of a period with their checklists, created on first access.
    ClosingOverview { month: u32, year: i32 },

    IntelligentClosing { client_id: ClientId, month: u32, year: i32 },

    UpdateChecklistItem {
        item_id: ChecklistItemId,
        status: ItemStatus,
        #[serde(default)]
        actual_minutes: Option<u32>,
    },

    /// Replace the blocking issues of a closing. An empty list unblocks it.
    SetBlockingIssues { client_id: ClientId, month: u32, year: i32, issues: Vec<String> },

    RecordAdjustment { client_id: ClientId, month: u32, year: i32 },

    RegisterClient(Client),

    RecordPayment(Payment),

    /// Today when `today` is omitted.
    CheckOverduePayments {
        #[serde(default)]
        today: Option<NaiveDate>,
    },

    Notifications {
        #[serde(default)]
        unread_only: bool,
    },

    /// Mark one notification read, or all of them when no ID is given.
    MarkNotificationRead {
        #[serde(default)]
        notification_id: Option<NotificationId>,
    },

    AuditTrail {
        #[serde(default)]
        limit: Option<usize>,
    },
}

/// A response given to a TCP client by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    Batch(BatchReport),
    BatchCancelled { batch_id: BatchId, found: bool },
    TaskEnqueued { task_id: TaskId },
    Task(Option<QueueTask>),
    QueueStats(QueueStats),
    Workers(Vec<WorkerInstance>),
    WorkersCleanedUp { removed: Vec<WorkerId> },
    ClosingOverview { summary: PeriodSummary, closings: Vec<ClosingWithItems> },
    ClosingStep(ClosingStepReport),
    Closing(ClosingWithItems),
    ClosingStatus(ClosingStatus),
    ClientRegistered { client_id: ClientId },
    PaymentRecorded { payment_id: PaymentId },
    PaymentAlerts(MonitorState),
    Notifications { unread: usize, notifications: Vec<Notification> },
    NotificationsRead { marked: usize },
    AuditTrail(Vec<AuditEntry>),

    /// The request couldn't be handled. The connection stays usable.
    Error { message: String },
}
