//! Execution backend seam.
//!
//! The scheduler treats execution as opaque: it hands a task spec plus
//! the chosen worker to the backend and receives an outcome later, on a
//! spawned reporting task. Cluster submission systems, process pools and
//! test fixtures all sit behind this trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use shared_types::{ArtifactDraft, TaskId, TaskSpec, Worker};

/// Terminal result of one task execution
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Concrete output locations for every declared slot
    Succeeded(Vec<ArtifactDraft>),
    /// Structured failure detail, surfaced in the task record
    Failed(String),
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run the task to completion on the given worker. The future is
    /// awaited on a reporting task spawned by the scheduler, never inside
    /// a scheduling pass.
    async fn execute(&self, spec: TaskSpec, worker: Worker) -> ExecutionOutcome;

    /// Best-effort cancellation signal. Returns `true` when the backend
    /// acknowledges; an unacknowledged cancel is resolved by the
    /// scheduler's grace timeout.
    async fn cancel(&self, task_id: &TaskId) -> bool;
}

type TaskHandler = Arc<dyn Fn(TaskSpec) -> BoxFuture<'static, ExecutionOutcome> + Send + Sync>;

/// In-process backend with one async handler per task kind.
///
/// Stands in for a local process pool: useful for single-machine runs
/// and as the execution surface in tests. Cancellation is cooperative -
/// the backend acknowledges, and the running handler simply has its
/// outcome ignored by the scheduler.
#[derive(Default)]
pub struct LocalBackend {
    handlers: HashMap<String, TaskHandler>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one task kind (builder pattern)
    pub fn with_handler<F, Fut>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskSpec) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ExecutionOutcome> + Send + 'static,
    {
        self.handlers
            .insert(kind.into(), Arc::new(move |spec| Box::pin(handler(spec))));
        self
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    async fn execute(&self, spec: TaskSpec, worker: Worker) -> ExecutionOutcome {
        let Some(handler) = self.handlers.get(&spec.kind) else {
            tracing::warn!(task_id = %spec.id, kind = %spec.kind, "no handler for task kind");
            return ExecutionOutcome::Failed(format!("no handler for task kind '{}'", spec.kind));
        };
        tracing::debug!(task_id = %spec.id, worker_id = %worker.id, "local execution starting");
        handler(spec).await
    }

    async fn cancel(&self, task_id: &TaskId) -> bool {
        tracing::debug!(task_id = %task_id, "local backend acknowledging cancel");
        true
    }
}
