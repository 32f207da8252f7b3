//! End-to-end brain tests: the full loop of generators proposing work,
//! the scheduler executing it, and conditions driving adaptation until
//! the stopping condition fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reflow::backend::{ExecutionOutcome, LocalBackend};
use reflow::brain::{on_catalog_change, stop_after_successes, Brain};
use reflow::bundle::Bundle;
use reflow::condition::Condition;
use reflow::config::EngineConfig;
use reflow::generator::{ClaimedInputs, GeneratorError, TaskGenerator};
use reflow::orchestrator::Orchestrator;
use shared_types::{
    ArtifactDraft, EventKind, GeneratorId, OutputSlot, TaskSpec, TaskState, Worker,
};

// ============================================================================
// Test generators
// ============================================================================

/// Proposes one fixed-kind task per trigger, up to an optional limit
struct PulseGenerator {
    id: GeneratorId,
    kind: &'static str,
    proposed: usize,
    limit: Option<usize>,
}

impl PulseGenerator {
    fn new(kind: &'static str, limit: Option<usize>) -> Self {
        Self {
            id: GeneratorId::new(),
            kind,
            proposed: 0,
            limit,
        }
    }
}

impl TaskGenerator for PulseGenerator {
    fn id(&self) -> GeneratorId {
        self.id.clone()
    }

    fn propose(&mut self, _view: &Bundle) -> Result<Vec<TaskSpec>, GeneratorError> {
        if self.limit.is_some_and(|limit| self.proposed >= limit) {
            return Ok(Vec::new());
        }
        self.proposed += 1;
        Ok(vec![TaskSpec::new(self.kind, serde_json::json!({}))
            .with_output(OutputSlot::new("out", "file"))])
    }

    fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.proposed >= limit)
    }
}

/// Proposes one analysis task per unclaimed trajectory artifact
struct ConsumerGenerator {
    id: GeneratorId,
    claims: ClaimedInputs,
}

impl ConsumerGenerator {
    fn new() -> Self {
        Self {
            id: GeneratorId::new(),
            claims: ClaimedInputs::new(),
        }
    }
}

impl TaskGenerator for ConsumerGenerator {
    fn id(&self) -> GeneratorId {
        self.id.clone()
    }

    fn propose(&mut self, view: &Bundle) -> Result<Vec<TaskSpec>, GeneratorError> {
        let mut batch = Vec::new();
        for artifact in self.claims.unclaimed(&view.of_kind("trajectory")) {
            self.claims.claim(&artifact.id);
            batch.push(
                TaskSpec::new("analyze", serde_json::json!({}))
                    .with_input(artifact.id.clone())
                    .with_output(OutputSlot::new("model", "model")),
            );
        }
        Ok(batch)
    }
}

/// Always fails to propose; the loop must survive it
struct FaultyGenerator {
    id: GeneratorId,
}

impl TaskGenerator for FaultyGenerator {
    fn id(&self) -> GeneratorId {
        self.id.clone()
    }

    fn propose(&mut self, _view: &Bundle) -> Result<Vec<TaskSpec>, GeneratorError> {
        Err(GeneratorError::Policy("no viable frames".to_string()))
    }
}

// ============================================================================
// Trigger factories
// ============================================================================

/// Fires immediately on first arming, then on each task completion
fn now_then_on_completion() -> impl Fn() -> Condition + Send + 'static {
    let armed = AtomicBool::new(false);
    move || {
        if armed.swap(true, Ordering::SeqCst) {
            Condition::on(shared_types::EventKindTag::TaskFinished)
        } else {
            Condition::Now
        }
    }
}

/// Fires immediately on first arming, never again
fn now_once() -> impl Fn() -> Condition + Send + 'static {
    let armed = AtomicBool::new(false);
    move || {
        if armed.swap(true, Ordering::SeqCst) {
            Condition::Never
        } else {
            Condition::Now
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

fn drafts_for(spec: &TaskSpec) -> Vec<ArtifactDraft> {
    spec.outputs
        .iter()
        .map(|slot| ArtifactDraft::new(&slot.name, &slot.kind, format!("/data/{}", slot.name)))
        .collect()
}

fn instant_handler(
) -> impl Fn(TaskSpec) -> std::pin::Pin<Box<dyn std::future::Future<Output = ExecutionOutcome> + Send>>
       + Send
       + Sync
       + 'static {
    |spec: TaskSpec| Box::pin(async move { ExecutionOutcome::Succeeded(drafts_for(&spec)) })
}

async fn start_engine(backend: LocalBackend) -> Orchestrator {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let orchestrator = Orchestrator::start(EngineConfig::default(), Arc::new(backend))
        .await
        .expect("orchestrator start");
    orchestrator
        .register_worker(Worker::new(4))
        .await
        .expect("register worker");
    orchestrator
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn stops_after_target_successes_without_overshooting() {
    let backend = LocalBackend::new().with_handler("work", instant_handler());
    let orchestrator = start_engine(backend).await;

    let mut brain = Brain::new(stop_after_successes(3));
    brain.bind(PulseGenerator::new("work", None), now_then_on_completion());

    let report = brain.run(&orchestrator).await.expect("brain run");
    // The generator itself never exhausts; only the stopping condition
    // bounds the run.
    assert_eq!(report.submitted, 3);
    assert_eq!(report.triggers, 3);

    let outcomes = orchestrator.outcomes().await.expect("outcomes");
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|r| r.state == TaskState::Success));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn competing_generators_cannot_double_claim_an_input() {
    let backend = LocalBackend::new()
        .with_handler("seed", |spec: TaskSpec| async move {
            ExecutionOutcome::Succeeded(vec![ArtifactDraft::new(
                "out",
                "trajectory",
                "/data/traj-0.dcd",
            )
            .with_size(spec.payload.to_string().len() as u64)])
        })
        .with_handler("analyze", instant_handler());
    let orchestrator = start_engine(backend).await;

    let mut brain = Brain::new(stop_after_successes(2));
    brain
        .bind(PulseGenerator::new("seed", Some(1)), || Condition::Now)
        .bind(ConsumerGenerator::new(), on_catalog_change())
        .bind(ConsumerGenerator::new(), on_catalog_change());

    let report = brain.run(&orchestrator).await.expect("brain run");
    // One seed, one analysis: the second consumer's batch over the same
    // trajectory is rejected wholesale.
    assert_eq!(report.submitted, 2);

    let outcomes = orchestrator.outcomes().await.expect("outcomes");
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|r| r.state == TaskState::Success));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn external_stop_request_terminates_an_idle_loop() {
    let backend = LocalBackend::new();
    let orchestrator = start_engine(backend).await;

    let brain = Brain::new(Condition::stop_requested);
    let (report, ()) = tokio::join!(brain.run(&orchestrator), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.request_stop("operator").expect("signal");
    });

    let report = report.expect("brain run");
    assert_eq!(report.submitted, 0);
    assert!(matches!(
        report.stop_event.map(|e| e.kind),
        Some(EventKind::StopRequested)
    ));

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn faulty_generator_does_not_kill_the_loop() {
    let backend = LocalBackend::new();
    let orchestrator = start_engine(backend).await;

    let mut brain = Brain::new(Condition::stop_requested);
    brain.bind(FaultyGenerator { id: GeneratorId::new() }, now_once());

    let (report, ()) = tokio::join!(brain.run(&orchestrator), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.request_stop("operator").expect("signal");
    });

    let report = report.expect("brain run");
    // The faulty trigger fired and was skipped; nothing was submitted
    assert_eq!(report.triggers, 1);
    assert_eq!(report.submitted, 0);

    orchestrator.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn stopping_drains_in_flight_work_before_returning() {
    let backend = LocalBackend::new().with_handler("slow", |spec: TaskSpec| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        ExecutionOutcome::Succeeded(drafts_for(&spec))
    });
    let orchestrator = start_engine(backend).await;

    let mut brain = Brain::new(Condition::stop_requested);
    brain.bind(PulseGenerator::new("slow", Some(1)), || Condition::Now);

    let (report, ()) = tokio::join!(brain.run(&orchestrator), async {
        // Stop while the slow task is still running
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.request_stop("operator").expect("signal");
    });

    let report = report.expect("brain run");
    assert_eq!(report.submitted, 1);
    assert_eq!(report.drained_in_flight, 1);

    // The drained task ran to completion, outputs and all
    let outcomes = orchestrator.outcomes().await.expect("outcomes");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, TaskState::Success);
    let bundle = orchestrator.snapshot().await.expect("snapshot");
    assert_eq!(bundle.len(), 1);

    orchestrator.shutdown().await.expect("shutdown");
}
