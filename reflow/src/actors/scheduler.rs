//! SchedulerActor - matches queued tasks to workers and tracks in-flight
//! execution.
//!
//! Matching policy: first-fit over live workers ordered by ascending
//! current load, ties broken by registration order. A task with no
//! matching worker stays queued; temporary unavailability is never a
//! failure.
//!
//! Dispatch is asynchronous: the backend future runs on a spawned
//! reporting task that casts `ExecutionFinished` back into the actor, so
//! a scheduling pass never blocks on execution. Worker loss and
//! cooperative cancellation (with a bounded grace period) are handled
//! here as well; every terminal transition emits a fan-out
//! `TaskFinished` event and a catalog record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{
    ArtifactId, Event, FailureReason, TaskId, TaskRecord, TaskSpec, TaskState, Worker, WorkerId,
};

use crate::actors::catalog::{CatalogError, CatalogMsg};
use crate::actors::event_engine::{self, EventEngineMsg};
use crate::backend::{ExecutionBackend, ExecutionOutcome};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("declared inputs missing from catalog: {0:?}")]
    InputUnavailable(Vec<ArtifactId>),

    #[error("scheduler is draining and not accepting tasks")]
    Draining,

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is already terminal")]
    AlreadyTerminal(TaskId),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {0} still holds assigned tasks; fail it via WorkerLost instead")]
    WorkerBusy(WorkerId),

    #[error("scheduler rpc failed: {0}")]
    Rpc(String),
}

#[derive(Debug)]
pub enum SchedulerMsg {
    /// Accept a task; validates declared inputs against the catalog
    Submit {
        spec: TaskSpec,
        reply: RpcReplyPort<Result<TaskId, SchedulerError>>,
    },
    /// Add an execution slot (startup or dynamic registration)
    RegisterWorker { worker: Worker },
    /// Graceful removal; refused while the worker holds assignments
    DeregisterWorker {
        worker_id: WorkerId,
        reply: RpcReplyPort<Result<(), SchedulerError>>,
    },
    /// Backend/inventory reports the worker unreachable: its running
    /// tasks fail with `WorkerLost` and the slot is removed
    WorkerLost { worker_id: WorkerId },
    /// Explicit cancellation request
    Cancel {
        task_id: TaskId,
        reply: RpcReplyPort<Result<(), SchedulerError>>,
    },
    /// Completion report from a spawned execution task
    ExecutionFinished {
        task_id: TaskId,
        outcome: ExecutionOutcome,
    },
    /// Backend answered a cancellation request
    CancelAcked { task_id: TaskId, acked: bool },
    /// Grace period for a cancellation elapsed
    CancelTimedOut { task_id: TaskId },
    /// Stop accepting tasks; cancels the queue, returns the running set
    Drain {
        reply: RpcReplyPort<Vec<TaskId>>,
    },
    TaskInfo {
        task_id: TaskId,
        reply: RpcReplyPort<Option<TaskSnapshot>>,
    },
    QueueStats { reply: RpcReplyPort<QueueStats> },
}

/// Point-in-time view of one task for queries and tests
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub state: TaskState,
    pub worker: Option<WorkerId>,
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub workers: usize,
    pub draining: bool,
}

pub struct SchedulerArguments {
    pub backend: Arc<dyn ExecutionBackend>,
    pub catalog: ActorRef<CatalogMsg>,
    pub event_engine: ActorRef<EventEngineMsg>,
    /// Grace period before an unacknowledged cancel forces `Failed`
    pub cancel_grace: Duration,
}

struct WorkerSlot {
    worker: Worker,
    assigned: Vec<TaskId>,
}

struct TaskEntry {
    spec: TaskSpec,
    state: TaskState,
    worker: Option<WorkerId>,
    cancel_requested: bool,
}

pub struct SchedulerState {
    backend: Arc<dyn ExecutionBackend>,
    catalog: ActorRef<CatalogMsg>,
    event_engine: ActorRef<EventEngineMsg>,
    /// Registration order is the documented tie-break
    workers: Vec<WorkerSlot>,
    queue: VecDeque<TaskId>,
    tasks: HashMap<TaskId, TaskEntry>,
    draining: bool,
    cancel_grace: Duration,
}

#[derive(Default)]
pub struct SchedulerActor;

#[async_trait]
impl Actor for SchedulerActor {
    type Msg = SchedulerMsg;
    type State = SchedulerState;
    type Arguments = SchedulerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            cancel_grace_ms = args.cancel_grace.as_millis() as u64,
            "SchedulerActor starting"
        );
        Ok(SchedulerState {
            backend: args.backend,
            catalog: args.catalog,
            event_engine: args.event_engine,
            workers: Vec::new(),
            queue: VecDeque::new(),
            tasks: HashMap::new(),
            draining: false,
            cancel_grace: args.cancel_grace,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMsg::Submit { spec, reply } => {
                let result = Self::submit(state, spec).await;
                if let Ok(task_id) = &result {
                    tracing::info!(task_id = %task_id, queued = state.queue.len(), "task queued");
                }
                let _ = reply.send(result);
                Self::schedule_pass(&myself, state);
            }
            SchedulerMsg::RegisterWorker { worker } => {
                if state.workers.iter().any(|s| s.worker.id == worker.id) {
                    tracing::warn!(worker_id = %worker.id, "duplicate worker registration ignored");
                    return Ok(());
                }
                tracing::info!(
                    worker_id = %worker.id,
                    capacity = worker.capacity,
                    "worker registered"
                );
                let event = Event::worker_registered(worker.id.clone());
                state.workers.push(WorkerSlot {
                    worker,
                    assigned: Vec::new(),
                });
                Self::emit(state, event);
                Self::schedule_pass(&myself, state);
            }
            SchedulerMsg::DeregisterWorker { worker_id, reply } => {
                let result = match state.workers.iter().position(|s| s.worker.id == worker_id) {
                    None => Err(SchedulerError::UnknownWorker(worker_id)),
                    Some(idx) if !state.workers[idx].assigned.is_empty() => {
                        Err(SchedulerError::WorkerBusy(worker_id))
                    }
                    Some(idx) => {
                        state.workers.remove(idx);
                        tracing::info!(worker_id = %worker_id, "worker deregistered");
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            SchedulerMsg::WorkerLost { worker_id } => {
                Self::worker_lost(&myself, state, worker_id);
            }
            SchedulerMsg::Cancel { task_id, reply } => {
                let result = Self::cancel(&myself, state, task_id);
                let _ = reply.send(result);
            }
            SchedulerMsg::ExecutionFinished { task_id, outcome } => {
                Self::execution_finished(&myself, state, task_id, outcome).await;
            }
            SchedulerMsg::CancelAcked { task_id, acked } => {
                let still_running = state
                    .tasks
                    .get(&task_id)
                    .map(|e| e.state == TaskState::Running && e.cancel_requested)
                    .unwrap_or(false);
                if still_running && acked {
                    tracing::info!(task_id = %task_id, "cancellation acknowledged");
                    Self::finalize(&myself, state, &task_id, TaskState::Cancelled, None);
                } else if still_running {
                    tracing::debug!(task_id = %task_id, "cancel not acknowledged; awaiting grace timeout");
                }
            }
            SchedulerMsg::CancelTimedOut { task_id } => {
                let still_running = state
                    .tasks
                    .get(&task_id)
                    .map(|e| e.state == TaskState::Running && e.cancel_requested)
                    .unwrap_or(false);
                if still_running {
                    tracing::warn!(task_id = %task_id, "cancellation grace period elapsed");
                    Self::finalize(
                        &myself,
                        state,
                        &task_id,
                        TaskState::Failed,
                        Some(FailureReason::CancellationTimeout),
                    );
                }
            }
            SchedulerMsg::Drain { reply } => {
                state.draining = true;
                let queued: Vec<TaskId> = state.queue.iter().cloned().collect();
                for task_id in queued {
                    tracing::info!(task_id = %task_id, "cancelling queued task for drain");
                    Self::finalize(&myself, state, &task_id, TaskState::Cancelled, None);
                }
                let running: Vec<TaskId> = state
                    .tasks
                    .iter()
                    .filter(|(_, e)| e.state == TaskState::Running)
                    .map(|(id, _)| id.clone())
                    .collect();
                tracing::info!(in_flight = running.len(), "scheduler draining");
                let _ = reply.send(running);
            }
            SchedulerMsg::TaskInfo { task_id, reply } => {
                let snapshot = state.tasks.get(&task_id).map(|e| TaskSnapshot {
                    task_id: task_id.clone(),
                    state: e.state,
                    worker: e.worker.clone(),
                });
                let _ = reply.send(snapshot);
            }
            SchedulerMsg::QueueStats { reply } => {
                let running = state
                    .tasks
                    .values()
                    .filter(|e| e.state == TaskState::Running)
                    .count();
                let _ = reply.send(QueueStats {
                    queued: state.queue.len(),
                    running,
                    workers: state.workers.len(),
                    draining: state.draining,
                });
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let in_flight = state
            .tasks
            .values()
            .filter(|e| !e.state.is_terminal())
            .count();
        tracing::info!(
            actor_id = %myself.get_id(),
            in_flight,
            "SchedulerActor stopped"
        );
        Ok(())
    }
}

impl SchedulerActor {
    async fn submit(state: &mut SchedulerState, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        if state.draining {
            return Err(SchedulerError::Draining);
        }

        // Inputs must resolve before the task exists anywhere; a missing
        // handle fails creation, it never silently skips.
        if !spec.inputs.is_empty() {
            let missing = ractor::call!(&state.catalog, |reply| CatalogMsg::Missing {
                ids: spec.inputs.clone(),
                reply
            })
            .map_err(|e| SchedulerError::Rpc(e.to_string()))?;
            if !missing.is_empty() {
                tracing::warn!(task_id = %spec.id, ?missing, "task rejected: inputs unavailable");
                return Err(SchedulerError::InputUnavailable(missing));
            }
        }

        let task_id = spec.id.clone();
        state.tasks.insert(
            task_id.clone(),
            TaskEntry {
                spec,
                state: TaskState::Queued,
                worker: None,
                cancel_requested: false,
            },
        );
        state.queue.push_back(task_id.clone());
        Ok(task_id)
    }

    /// One scheduling pass: first-fit over workers by ascending load,
    /// registration order breaking ties (stable sort).
    fn schedule_pass(myself: &ActorRef<SchedulerMsg>, state: &mut SchedulerState) {
        let mut unmatched = VecDeque::new();
        while let Some(task_id) = state.queue.pop_front() {
            let Some(entry) = state.tasks.get(&task_id) else {
                continue;
            };
            if entry.state != TaskState::Queued {
                // Cancelled while queued; drop the stale queue slot
                continue;
            }

            let mut order: Vec<usize> = (0..state.workers.len()).collect();
            order.sort_by_key(|&i| state.workers[i].assigned.len());
            let chosen = order.into_iter().find(|&i| {
                let slot = &state.workers[i];
                slot.assigned.len() < slot.worker.capacity
                    && slot.worker.can_satisfy(&entry.spec.requirements)
            });

            match chosen {
                Some(idx) => Self::dispatch(myself, state, task_id, idx),
                None => unmatched.push_back(task_id),
            }
        }
        state.queue = unmatched;
    }

    fn dispatch(
        myself: &ActorRef<SchedulerMsg>,
        state: &mut SchedulerState,
        task_id: TaskId,
        worker_idx: usize,
    ) {
        let worker = state.workers[worker_idx].worker.clone();
        state.workers[worker_idx].assigned.push(task_id.clone());

        let entry = state
            .tasks
            .get_mut(&task_id)
            .expect("dispatch called for known task");
        entry.state = TaskState::Running;
        entry.worker = Some(worker.id.clone());
        tracing::info!(
            task_id = %task_id,
            worker_id = %worker.id,
            load = state.workers[worker_idx].assigned.len(),
            "task dispatched"
        );

        let backend = state.backend.clone();
        let spec = entry.spec.clone();
        let report_to = myself.clone();
        tokio::spawn(async move {
            let outcome = backend.execute(spec, worker).await;
            let _ = report_to.cast(SchedulerMsg::ExecutionFinished { task_id, outcome });
        });
    }

    async fn execution_finished(
        myself: &ActorRef<SchedulerMsg>,
        state: &mut SchedulerState,
        task_id: TaskId,
        outcome: ExecutionOutcome,
    ) {
        let Some(entry) = state.tasks.get(&task_id) else {
            tracing::warn!(task_id = %task_id, "completion for unknown task ignored");
            return;
        };
        if entry.state != TaskState::Running {
            // Already resolved (worker lost, cancelled, or grace timeout)
            tracing::debug!(
                task_id = %task_id,
                state = %entry.state,
                "late completion ignored"
            );
            return;
        }

        match outcome {
            ExecutionOutcome::Succeeded(drafts) => {
                let declared = entry.spec.outputs.clone();
                let commit = ractor::call!(&state.catalog, |reply| CatalogMsg::CommitOutputs {
                    task_id: task_id.clone(),
                    declared,
                    drafts,
                    reply
                });
                match commit {
                    Ok(Ok(artifacts)) => {
                        tracing::info!(
                            task_id = %task_id,
                            artifacts = artifacts.len(),
                            "task succeeded"
                        );
                        Self::finalize(myself, state, &task_id, TaskState::Success, None);
                    }
                    Ok(Err(CatalogError::Consistency { detail, .. })) => {
                        tracing::error!(task_id = %task_id, detail = %detail, "output batch rejected");
                        Self::finalize(
                            myself,
                            state,
                            &task_id,
                            TaskState::Failed,
                            Some(FailureReason::CatalogConsistency { detail }),
                        );
                    }
                    Ok(Err(e)) => {
                        Self::finalize(
                            myself,
                            state,
                            &task_id,
                            TaskState::Failed,
                            Some(FailureReason::Execution {
                                detail: format!("catalog commit failed: {e}"),
                            }),
                        );
                    }
                    Err(e) => {
                        Self::finalize(
                            myself,
                            state,
                            &task_id,
                            TaskState::Failed,
                            Some(FailureReason::Execution {
                                detail: format!("catalog unreachable: {e}"),
                            }),
                        );
                    }
                }
            }
            ExecutionOutcome::Failed(detail) => {
                tracing::warn!(task_id = %task_id, detail = %detail, "task failed");
                Self::finalize(
                    myself,
                    state,
                    &task_id,
                    TaskState::Failed,
                    Some(FailureReason::Execution { detail }),
                );
            }
        }
    }

    fn cancel(
        myself: &ActorRef<SchedulerMsg>,
        state: &mut SchedulerState,
        task_id: TaskId,
    ) -> Result<(), SchedulerError> {
        let entry = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.clone()))?;

        match entry.state {
            TaskState::Queued => {
                // Immediate and local: the task was never dispatched
                tracing::info!(task_id = %task_id, "queued task cancelled");
                Self::finalize(myself, state, &task_id, TaskState::Cancelled, None);
                Ok(())
            }
            TaskState::Running => {
                if !entry.cancel_requested {
                    entry.cancel_requested = true;
                    tracing::info!(task_id = %task_id, "forwarding cancel to backend");

                    let backend = state.backend.clone();
                    let ack_to = myself.clone();
                    let ack_task = task_id.clone();
                    tokio::spawn(async move {
                        let acked = backend.cancel(&ack_task).await;
                        let _ = ack_to.cast(SchedulerMsg::CancelAcked {
                            task_id: ack_task,
                            acked,
                        });
                    });

                    let grace = state.cancel_grace;
                    let timeout_to = myself.clone();
                    let timeout_task = task_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = timeout_to.cast(SchedulerMsg::CancelTimedOut {
                            task_id: timeout_task,
                        });
                    });
                }
                Ok(())
            }
            other if other.is_terminal() => Err(SchedulerError::AlreadyTerminal(task_id)),
            _ => Err(SchedulerError::UnknownTask(task_id)),
        }
    }

    fn worker_lost(
        myself: &ActorRef<SchedulerMsg>,
        state: &mut SchedulerState,
        worker_id: WorkerId,
    ) {
        let Some(idx) = state.workers.iter().position(|s| s.worker.id == worker_id) else {
            tracing::warn!(worker_id = %worker_id, "loss report for unknown worker");
            return;
        };
        let slot = state.workers.remove(idx);
        tracing::error!(
            worker_id = %worker_id,
            orphaned = slot.assigned.len(),
            "worker lost; failing its running tasks"
        );
        for task_id in slot.assigned {
            let running = state
                .tasks
                .get(&task_id)
                .map(|e| e.state == TaskState::Running)
                .unwrap_or(false);
            if running {
                Self::finalize(
                    myself,
                    state,
                    &task_id,
                    TaskState::Failed,
                    Some(FailureReason::WorkerLost {
                        worker_id: worker_id.clone(),
                    }),
                );
            }
        }
        Self::emit(state, Event::worker_lost(worker_id));
    }

    /// Single terminal-transition path: updates state, frees the worker
    /// slot, records history in the catalog, and emits the fan-out
    /// completion event.
    fn finalize(
        myself: &ActorRef<SchedulerMsg>,
        state: &mut SchedulerState,
        task_id: &TaskId,
        final_state: TaskState,
        failure: Option<FailureReason>,
    ) {
        debug_assert!(final_state.is_terminal());
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return;
        };
        entry.state = final_state;

        if let Some(worker_id) = &entry.worker {
            if let Some(slot) = state
                .workers
                .iter_mut()
                .find(|s| &s.worker.id == worker_id)
            {
                slot.assigned.retain(|t| t != task_id);
            }
        }

        let record = TaskRecord {
            spec: entry.spec.clone(),
            state: final_state,
            failure,
            worker: entry.worker.clone(),
            finished_at: Utc::now(),
        };
        if let Err(e) = state.catalog.cast(CatalogMsg::RecordTask { record }) {
            tracing::warn!(task_id = %task_id, error = %e, "failed to record task outcome");
        }

        Self::emit(
            state,
            Event::task_finished(task_id.clone(), final_state, "scheduler"),
        );

        // A freed slot may unblock queued work
        Self::schedule_pass(myself, state);
    }

    fn emit(state: &SchedulerState, event: Event) {
        if let Err(e) = event_engine::signal(&state.event_engine, event) {
            tracing::warn!(error = %e, "failed to signal scheduler event");
        }
    }
}
