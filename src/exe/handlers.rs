use crate::closing::{ChecklistItemType, ClosingTracker};
use crate::messaging::{QueueTask, TaskKind, TaskPayload};
use crate::store::{ClientDirectory, ClosingStore};
use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;

/// Executes the tasks of one or more task types.
///
/// An error, or a panic, counts as a failed attempt of the task and is subject to retries. The
/// returned JSON is stored as the task's result.
///
pub trait TaskHandler: Send + Sync {
    fn handle<'a>(&'a self, task: &'a QueueTask, payload: TaskPayload) -> BoxFuture<'a, Result<Value, anyhow::Error>>;
}

/// A [`TaskHandler`] built from a closure.
pub struct HandlerFn<F>(F);

impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(QueueTask, TaskPayload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
{
    fn handle<'a>(&'a self, task: &'a QueueTask, payload: TaskPayload) -> BoxFuture<'a, Result<Value, anyhow::Error>> {
        Box::pin((self.0)(task.clone(), payload))
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(QueueTask, TaskPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Handlers keyed by the task type they execute.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handlers advancing monthly closings, one for every task type.
    pub fn closing<S>(tracker: Arc<ClosingTracker<S>>) -> Self
    where
        S: ClosingStore + ClientDirectory + Send + Sync + 'static,
    {
        let handler: Arc<dyn TaskHandler> = Arc::new(ClosingHandler { tracker });
        [
            TaskKind::MonthlyClosing,
            TaskKind::IntelligentClosing,
            TaskKind::DocumentValidation,
            TaskKind::ReportGeneration,
            TaskKind::ComplianceCheck,
        ]
        .into_iter()
        .fold(Self::new(), |registry, kind| registry.register(kind, handler.clone()))
    }

    pub fn register(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Maps queue tasks onto closing tracker operations.
struct ClosingHandler<S> {
    tracker: Arc<ClosingTracker<S>>,
}

impl<S> TaskHandler for ClosingHandler<S>
where
    S: ClosingStore + ClientDirectory + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, task: &'a QueueTask, payload: TaskPayload) -> BoxFuture<'a, Result<Value, anyhow::Error>> {
        Box::pin(async move {
            let client_id = task
                .client_id
                .as_ref()
                .ok_or_else(|| anyhow!("{} task {} has no client", task.task_type, task.id))?;

            let report = match payload {
                TaskPayload::MonthlyClosing { period, .. } => {
                    self.tracker.ensure_closing(client_id, period).await?;
                    self.tracker.intelligent_step(client_id, period).await?
                }
                TaskPayload::IntelligentClosing { period } => self.tracker.intelligent_step(client_id, period).await?,
                TaskPayload::DocumentValidation { period, .. } => {
                    self.tracker
                        .complete_items_of_type(client_id, period, ChecklistItemType::DocumentValidation)
                        .await?
                }
                TaskPayload::ReportGeneration { period, .. } => {
                    self.tracker
                        .complete_items_of_type(client_id, period, ChecklistItemType::ReportGeneration)
                        .await?
                }
                TaskPayload::ComplianceCheck { period } => {
                    self.tracker
                        .complete_items_of_type(client_id, period, ChecklistItemType::ComplianceCheck)
                        .await?
                }
            };
            serde_json::to_value(report).context("serializing closing step report")
        })
    }
}
