//! Shared domain types for the reflow orchestration engine
//!
//! These types cross every boundary in the system:
//! - the engine actors (catalog, scheduler, event engine)
//! - execution backends (local pool, cluster submission adapters)
//! - persisted catalog snapshots on disk
//!
//! Everything here is serde-serializable so catalog state and task
//! history survive restarts as plain JSON.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::EnumDiscriminants;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, ulid::Ulid::new()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a schedulable unit of work
    TaskId,
    "task"
);
ulid_id!(
    /// Unique identifier for a recorded catalog artifact
    ArtifactId,
    "artifact"
);
ulid_id!(
    /// Unique identifier for a remote execution slot
    WorkerId,
    "worker"
);
ulid_id!(
    /// Unique identifier for a task generator instance
    GeneratorId,
    "generator"
);

// ============================================================================
// Workers and capabilities
// ============================================================================

/// Capability tag a worker advertises and a task may require (e.g. "gpu")
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Capability(pub String);

impl Capability {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote execution slot: a cluster allocation or a local process.
///
/// Runtime state (current assignments, liveness) lives in the scheduler
/// registry; this struct is the durable description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub id: WorkerId,
    /// Maximum number of concurrently assigned tasks
    pub capacity: usize,
    /// Capability tags this worker can satisfy
    pub capabilities: HashSet<Capability>,
}

impl Worker {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: WorkerId::new(),
            capacity: capacity.max(1),
            capabilities: HashSet::new(),
        }
    }

    /// Add a capability tag (builder pattern)
    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(Capability::new(tag));
        self
    }

    pub fn can_satisfy(&self, requirements: &[Capability]) -> bool {
        requirements.iter().all(|r| self.capabilities.contains(r))
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Task lifecycle states.
///
/// `Created -> Queued -> Running -> {Success, Failed, Cancelled}`.
/// Terminal transitions always emit a `TaskFinished` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Success => write!(f, "success"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Declared output slot a task will populate on success.
///
/// Successful tasks must materialize every declared slot; the catalog
/// rejects partial batches outright.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSlot {
    /// Slot name, unique within one task (e.g. "trajectory", "model")
    pub name: String,
    /// Artifact kind recorded for catalog queries
    pub kind: String,
}

impl OutputSlot {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Description of one schedulable unit of work.
///
/// The payload is opaque to the engine: simulation parameters, analysis
/// input, or whatever the execution backend understands for `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Task kind, routed to a backend handler (e.g. "trajectory.extend")
    pub kind: String,
    pub payload: serde_json::Value,
    /// Catalog handles this task consumes; validated at submission
    pub inputs: Vec<ArtifactId>,
    /// Output slots committed atomically on success
    pub outputs: Vec<OutputSlot>,
    /// Capability tags a worker must advertise to run this task
    pub requirements: Vec<Capability>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            kind: kind.into(),
            payload,
            inputs: Vec::new(),
            outputs: Vec::new(),
            requirements: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: ArtifactId) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, slot: OutputSlot) -> Self {
        self.outputs.push(slot);
        self
    }

    pub fn requires(mut self, tag: impl Into<String>) -> Self {
        self.requirements.push(Capability::new(tag));
        self
    }
}

/// Structured reason attached to tasks that reach `Failed`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("declared inputs missing from catalog: {missing:?}")]
    InputUnavailable { missing: Vec<ArtifactId> },

    #[error("worker {worker_id} lost while task was running")]
    WorkerLost { worker_id: WorkerId },

    #[error("worker did not acknowledge cancellation within the grace period")]
    CancellationTimeout,

    #[error("output batch rejected by catalog: {detail}")]
    CatalogConsistency { detail: String },

    #[error("execution failed: {detail}")]
    Execution { detail: String },
}

/// Historical record of a task that reached a terminal state.
///
/// Retained in the catalog as the queryable log of outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub state: TaskState,
    pub failure: Option<FailureReason>,
    /// Worker the task last ran on, if it was ever dispatched
    pub worker: Option<WorkerId>,
    pub finished_at: DateTime<Utc>,
}

// ============================================================================
// Artifacts
// ============================================================================

/// An immutable produced entity recorded in the catalog.
///
/// Artifacts are never mutated in place; a new version is a new artifact
/// pointing back via `supersedes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Declared slot name this artifact filled on its producer
    pub slot: String,
    /// Artifact kind for queries (e.g. "trajectory", "model", "file")
    pub kind: String,
    /// Backend-supplied location reference; contents are never interpreted
    pub location: String,
    pub size: u64,
    pub producer: TaskId,
    pub supersedes: Option<ArtifactId>,
    /// Catalog-wide monotonic sequence number, assigned at commit
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Backend-supplied output awaiting catalog commit.
///
/// The catalog turns drafts into `Artifact`s once the full declared
/// output set of the producing task is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactDraft {
    pub slot: String,
    pub kind: String,
    pub location: String,
    pub size: u64,
    pub supersedes: Option<ArtifactId>,
}

impl ArtifactDraft {
    pub fn new(slot: impl Into<String>, kind: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            kind: kind.into(),
            location: location.into(),
            size: 0,
            supersedes: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn superseding(mut self, previous: ArtifactId) -> Self {
        self.supersedes = Some(previous);
        self
    }
}

// ============================================================================
// Events
// ============================================================================

/// What happened, as a tagged fact.
///
/// `EventKindTag` (the strum discriminant type) is what conditions use to
/// declare interest without matching on payload fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, EnumDiscriminants)]
#[strum_discriminants(name(EventKindTag), derive(Hash))]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task reached a terminal state (fan-out to all waiters)
    TaskFinished { task_id: TaskId, state: TaskState },
    /// An artifact batch member became visible in the catalog
    CatalogChanged {
        artifact_id: ArtifactId,
        producer: TaskId,
    },
    WorkerRegistered { worker_id: WorkerId },
    WorkerLost { worker_id: WorkerId },
    /// External stop requested; observed by the brain's stopping condition
    StopRequested,
    /// Generic named signal for domain extensions
    Custom(String),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::TaskFinished { task_id, state } => {
                write!(f, "task_finished({task_id}, {state})")
            }
            EventKind::CatalogChanged { artifact_id, .. } => {
                write!(f, "catalog_changed({artifact_id})")
            }
            EventKind::WorkerRegistered { worker_id } => {
                write!(f, "worker_registered({worker_id})")
            }
            EventKind::WorkerLost { worker_id } => write!(f, "worker_lost({worker_id})"),
            EventKind::StopRequested => write!(f, "stop_requested"),
            EventKind::Custom(name) => write!(f, "custom.{name}"),
        }
    }
}

/// An immutable, timestamped fact delivered once to all current waiters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event identifier (ULID)
    pub id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Producing component ("scheduler", "catalog", an operator surface)
    pub source: String,
    /// Optional extra context, opaque to the engine
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            kind,
            timestamp: Utc::now(),
            source: source.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a payload (builder pattern)
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn task_finished(task_id: TaskId, state: TaskState, source: impl Into<String>) -> Self {
        Self::new(EventKind::TaskFinished { task_id, state }, source)
    }

    pub fn catalog_changed(artifact_id: ArtifactId, producer: TaskId) -> Self {
        Self::new(
            EventKind::CatalogChanged {
                artifact_id,
                producer,
            },
            "catalog",
        )
    }

    pub fn worker_registered(worker_id: WorkerId) -> Self {
        Self::new(EventKind::WorkerRegistered { worker_id }, "scheduler")
    }

    pub fn worker_lost(worker_id: WorkerId) -> Self {
        Self::new(EventKind::WorkerLost { worker_id }, "scheduler")
    }

    pub fn stop_requested(source: impl Into<String>) -> Self {
        Self::new(EventKind::StopRequested, source)
    }

    pub fn tag(&self) -> EventKindTag {
        EventKindTag::from(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("task-"));
        assert!(ArtifactId::new().as_str().starts_with("artifact-"));
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Created.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn worker_capability_matching() {
        let worker = Worker::new(2).with_capability("gpu").with_capability("large-mem");
        assert!(worker.can_satisfy(&[Capability::new("gpu")]));
        assert!(worker.can_satisfy(&[]));
        assert!(!worker.can_satisfy(&[Capability::new("fpga")]));
    }

    #[test]
    fn event_tags_match_kind_not_fields() {
        let a = Event::task_finished(TaskId::new(), TaskState::Success, "test");
        let b = Event::task_finished(TaskId::new(), TaskState::Failed, "test");
        assert_eq!(a.tag(), b.tag());
        assert_ne!(a.tag(), Event::stop_requested("test").tag());
    }

    #[test]
    fn task_spec_builder() {
        let input = ArtifactId::new();
        let spec = TaskSpec::new("trajectory.extend", serde_json::json!({"frames": 100}))
            .with_input(input.clone())
            .with_output(OutputSlot::new("trajectory", "trajectory"))
            .requires("gpu");
        assert_eq!(spec.inputs, vec![input]);
        assert_eq!(spec.outputs.len(), 1);
        assert_eq!(spec.requirements, vec![Capability::new("gpu")]);
    }

    #[test]
    fn records_round_trip_through_json() {
        let record = TaskRecord {
            spec: TaskSpec::new("analysis.msm", serde_json::json!(null)),
            state: TaskState::Failed,
            failure: Some(FailureReason::WorkerLost {
                worker_id: WorkerId::new(),
            }),
            worker: Some(WorkerId::new()),
            finished_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).expect("serialize");
        let back: TaskRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }
}
