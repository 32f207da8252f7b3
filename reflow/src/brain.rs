//! Brain - the adaptive control loop.
//!
//! The brain owns a set of generators, each bound to a condition
//! factory, plus one stopping condition. It suspends on the event
//! engine (cooperative, never busy-polling), and on each wakeup runs
//! exactly one generator against a fresh catalog snapshot, submits the
//! proposal, and re-arms the binding. All brain-owned state mutates on
//! this single loop; completions only ever reach it as events.
//!
//! Generator faults are contained: a failed `propose` (including a
//! cross-generator double-claim) skips that trigger and the loop keeps
//! running. Only the stopping condition terminates the loop, which then
//! drains the scheduler, waits out in-flight work up to the configured
//! timeout, cancels stragglers, and flushes the catalog.

use std::collections::{HashMap, HashSet};

use futures::future::{BoxFuture, Either};
use futures::FutureExt;
use shared_types::{ArtifactId, Event, GeneratorId, TaskId};
use tokio::sync::oneshot::error::RecvError;

use crate::actors::event_engine::{RegistrationId, Satisfied};
use crate::actors::scheduler::SchedulerMsg;
use crate::condition::Condition;
use crate::generator::{GeneratorError, TaskGenerator};
use crate::orchestrator::Orchestrator;

#[derive(Debug, thiserror::Error)]
pub enum BrainError {
    #[error("brain rpc failed: {0}")]
    Rpc(String),

    #[error(transparent)]
    EventEngine(#[from] crate::actors::event_engine::EventEngineError),
}

/// What the loop did before terminating
#[derive(Debug)]
pub struct BrainReport {
    /// Tasks successfully handed to the scheduler
    pub submitted: usize,
    /// Generator triggers that fired (including skipped faulty ones)
    pub triggers: usize,
    /// The event that satisfied the stopping condition, when there was one
    pub stop_event: Option<Event>,
    /// Tasks still in flight when draining began
    pub drained_in_flight: usize,
}

type ConditionFactory = Box<dyn Fn() -> Condition + Send>;

struct Binding {
    generator: Box<dyn TaskGenerator>,
    trigger: ConditionFactory,
    registration: Option<RegistrationId>,
}

enum Wake {
    Stop,
    Generator(usize),
}

type PendingWait = BoxFuture<'static, (Wake, Result<Satisfied, RecvError>)>;

pub struct Brain {
    bindings: Vec<Binding>,
    stop_trigger: ConditionFactory,
    /// Inputs claimed by submitted proposals, per generator; the
    /// double-claim guard across concurrently triggered generators
    claimed: HashMap<ArtifactId, GeneratorId>,
}

impl Brain {
    pub fn new(stop_trigger: impl Fn() -> Condition + Send + 'static) -> Self {
        Self {
            bindings: Vec::new(),
            stop_trigger: Box::new(stop_trigger),
            claimed: HashMap::new(),
        }
    }

    /// Bind a generator to the condition that should trigger it.
    /// The factory is invoked for every (re-)arming.
    pub fn bind(
        &mut self,
        generator: impl TaskGenerator + 'static,
        trigger: impl Fn() -> Condition + Send + 'static,
    ) -> &mut Self {
        self.bindings.push(Binding {
            generator: Box::new(generator),
            trigger: Box::new(trigger),
            registration: None,
        });
        self
    }

    /// Run to completion. Returns once the stopping condition fired and
    /// the scheduler has been drained.
    pub async fn run(mut self, ctx: &Orchestrator) -> Result<BrainReport, BrainError> {
        let mut submitted = 0usize;
        let mut triggers = 0usize;

        let stop_reg = ctx.register((self.stop_trigger)()).await?;
        let stop_registration = stop_reg.id;
        // Kept polled-first below: when one event satisfies the stop
        // condition and a generator trigger at once, stopping wins.
        let mut stop_wait: BoxFuture<'static, Result<Satisfied, RecvError>> = stop_reg.rx.boxed();

        let mut pending: Vec<PendingWait> = Vec::new();
        for idx in 0..self.bindings.len() {
            let reg = ctx.register((self.bindings[idx].trigger)()).await?;
            self.bindings[idx].registration = Some(reg.id);
            pending.push(async move { (Wake::Generator(idx), reg.rx.await) }.boxed());
        }
        tracing::info!(generators = self.bindings.len(), "brain loop starting");

        let stop_event = loop {
            let (wake, outcome) = if pending.is_empty() {
                (Wake::Stop, (&mut stop_wait).await)
            } else {
                match futures::future::select(
                    &mut stop_wait,
                    futures::future::select_all(pending.drain(..).collect::<Vec<_>>()),
                )
                .await
                {
                    Either::Left((stop_outcome, unfinished)) => {
                        pending = unfinished.into_inner();
                        (Wake::Stop, stop_outcome)
                    }
                    Either::Right((((wake, outcome), _idx, rest), _)) => {
                        pending = rest;
                        (wake, outcome)
                    }
                }
            };

            match wake {
                Wake::Stop => match outcome {
                    Ok(satisfied) => {
                        tracing::info!("stopping condition satisfied");
                        break satisfied.last_event;
                    }
                    Err(_) => {
                        tracing::warn!("stop registration cancelled externally; terminating");
                        break None;
                    }
                },
                Wake::Generator(idx) => {
                    self.bindings[idx].registration = None;
                    if outcome.is_err() {
                        tracing::debug!(binding = idx, "trigger registration cancelled");
                        continue;
                    }
                    triggers += 1;

                    // Re-arm before running the generator: completions
                    // that land while we propose/submit must still wake
                    // the next trigger.
                    let rearmed = ctx.register((self.bindings[idx].trigger)()).await?;
                    self.bindings[idx].registration = Some(rearmed.id);

                    submitted += self.run_generator(ctx, idx).await?;

                    if self.bindings[idx].generator.exhausted() {
                        tracing::info!(
                            generator = %self.bindings[idx].generator.id(),
                            "generator exhausted; not re-arming"
                        );
                        let _ = ctx.event_engine().cast(
                            crate::actors::event_engine::EventEngineMsg::Cancel {
                                registration: rearmed.id,
                            },
                        );
                        self.bindings[idx].registration = None;
                    } else {
                        pending
                            .push(async move { (Wake::Generator(idx), rearmed.rx.await) }.boxed());
                    }
                }
            }
        };

        // Teardown: stop waiting, stop accepting, let in-flight work land.
        for binding in &self.bindings {
            if let Some(id) = binding.registration {
                let _ = ctx
                    .event_engine()
                    .cast(crate::actors::event_engine::EventEngineMsg::Cancel { registration: id });
            }
        }
        let _ = ctx
            .event_engine()
            .cast(crate::actors::event_engine::EventEngineMsg::Cancel {
                registration: stop_registration,
            });

        let drained = self.drain(ctx).await?;

        if let Ok(Err(e)) = ractor::call!(&ctx.catalog(), |reply| {
            crate::actors::catalog::CatalogMsg::Flush { reply }
        }) {
            tracing::warn!(error = %e, "catalog flush failed during brain teardown");
        }

        tracing::info!(submitted, triggers, drained, "brain loop finished");
        Ok(BrainReport {
            submitted,
            triggers,
            stop_event,
            drained_in_flight: drained,
        })
    }

    /// Run one generator against a fresh snapshot and submit its batch.
    /// Returns the number of tasks accepted by the scheduler.
    async fn run_generator(&mut self, ctx: &Orchestrator, idx: usize) -> Result<usize, BrainError> {
        let view = ctx
            .snapshot()
            .await
            .map_err(|e| BrainError::Rpc(e.to_string()))?;

        let binding = &mut self.bindings[idx];
        let generator_id = binding.generator.id();
        let batch = match binding.generator.propose(&view) {
            Ok(batch) => batch,
            Err(e) => {
                // Non-fatal by contract: log, skip this trigger
                tracing::warn!(
                    generator = %generator_id,
                    error = %e,
                    "generator propose failed; skipping trigger"
                );
                return Ok(0);
            }
        };
        if batch.is_empty() {
            tracing::debug!(generator = %generator_id, "generator proposed nothing");
            return Ok(0);
        }

        // Cross-generator double-claim guard: reject the whole batch
        // rather than silently merging.
        let conflicts: Vec<ArtifactId> = batch
            .iter()
            .flat_map(|spec| spec.inputs.iter())
            .filter(|input| {
                self.claimed
                    .get(*input)
                    .map(|owner| *owner != generator_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            let err = GeneratorError::DoubleClaim(conflicts);
            tracing::warn!(
                generator = %generator_id,
                error = %err,
                "batch rejected; inputs claimed by another generator"
            );
            return Ok(0);
        }

        let mut accepted = 0usize;
        for spec in batch {
            let inputs = spec.inputs.clone();
            let task_id = spec.id.clone();
            match ctx.submit(spec).await {
                Ok(_) => {
                    accepted += 1;
                    for input in inputs {
                        self.claimed.insert(input, generator_id.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        generator = %generator_id,
                        task_id = %task_id,
                        error = %e,
                        "scheduler rejected proposed task"
                    );
                }
            }
        }
        tracing::info!(generator = %generator_id, accepted, "proposal submitted");
        Ok(accepted)
    }

    /// Drain the scheduler and wait for in-flight tasks, cancelling
    /// whatever outlives the drain timeout.
    async fn drain(&self, ctx: &Orchestrator) -> Result<usize, BrainError> {
        let scheduler = ctx.scheduler();
        let in_flight: Vec<TaskId> =
            ractor::call!(&scheduler, |reply| SchedulerMsg::Drain { reply })
                .map_err(|e| BrainError::Rpc(e.to_string()))?;
        if in_flight.is_empty() {
            return Ok(0);
        }
        tracing::info!(in_flight = in_flight.len(), "waiting for in-flight tasks");

        // Seed the wait with tasks that already went terminal so the
        // threshold only counts what is genuinely still running.
        let mut already_done: HashSet<TaskId> = HashSet::new();
        for task_id in &in_flight {
            let info = ractor::call!(&scheduler, |reply| SchedulerMsg::TaskInfo {
                task_id: task_id.clone(),
                reply
            })
            .map_err(|e| BrainError::Rpc(e.to_string()))?;
            if let Some(snapshot) = info {
                if snapshot.state.is_terminal() {
                    already_done.insert(task_id.clone());
                }
            }
        }
        let watched: HashSet<TaskId> = in_flight.iter().cloned().collect();
        let condition = Condition::TasksFinished {
            threshold: watched.len(),
            watched: Some(watched),
            require_success: false,
            seen: already_done,
        };

        let waited =
            tokio::time::timeout(ctx.config().drain_timeout(), ctx.wait_for(condition)).await;
        match waited {
            Ok(Ok(_)) => {
                tracing::info!("all in-flight tasks finished");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "drain wait cancelled");
            }
            Err(_elapsed) => {
                tracing::warn!(
                    timeout_ms = ctx.config().drain_timeout_ms,
                    "drain timeout; cancelling stragglers"
                );
                for task_id in &in_flight {
                    if let Err(e) = ctx.cancel(task_id.clone()).await {
                        tracing::debug!(task_id = %task_id, error = %e, "straggler cancel");
                    }
                }
            }
        }
        Ok(in_flight.len())
    }
}

/// Convenience stopping condition: N tasks succeeded, or an external
/// stop request - whichever comes first.
pub fn stop_after_successes(n: usize) -> impl Fn() -> Condition + Send + 'static {
    move || {
        Condition::any([
            Condition::n_tasks_succeeded(n),
            Condition::stop_requested(),
        ])
    }
}

/// Trigger that fires on the next task completion of any outcome.
pub fn on_next_completion() -> impl Fn() -> Condition + Send + 'static {
    || {
        Condition::OnEvent {
            tag: shared_types::EventKindTag::TaskFinished,
            seen: false,
        }
    }
}

/// Trigger that fires when the catalog changes.
pub fn on_catalog_change() -> impl Fn() -> Condition + Send + 'static {
    || {
        Condition::OnEvent {
            tag: shared_types::EventKindTag::CatalogChanged,
            seen: false,
        }
    }
}
