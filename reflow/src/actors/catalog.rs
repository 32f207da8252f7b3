//! CatalogActor - versioned, queryable store of produced artifacts.
//!
//! The catalog is an arena of immutable artifacts keyed by id, plus the
//! history of terminal task outcomes. Output batches commit atomically:
//! either every declared slot of the producing task is recorded, or
//! nothing is. Every successful add signals a `CatalogChanged` event so
//! generators and the brain react without polling.
//!
//! When a persistence path is configured, the index is written as a JSON
//! snapshot after each mutation and reloaded in `pre_start`, so a
//! restarted run replays catalog state before any generator condition is
//! armed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use shared_types::{Artifact, ArtifactDraft, ArtifactId, Event, OutputSlot, TaskId, TaskRecord};

use crate::actors::event_engine::{self, EventEngineMsg};
use crate::bundle::Bundle;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactId),

    #[error("inconsistent output batch for task {task_id}: {detail}")]
    Consistency { task_id: TaskId, detail: String },

    #[error("catalog persistence failed: {0}")]
    Persist(String),
}

#[derive(Debug)]
pub enum CatalogMsg {
    /// Atomically commit a task's full output batch. Drafts must cover
    /// the declared slots exactly; otherwise nothing is recorded.
    CommitOutputs {
        task_id: TaskId,
        declared: Vec<OutputSlot>,
        drafts: Vec<ArtifactDraft>,
        reply: RpcReplyPort<Result<Vec<ArtifactId>, CatalogError>>,
    },
    /// Dereference a handle
    Get {
        artifact_id: ArtifactId,
        reply: RpcReplyPort<Result<Arc<Artifact>, CatalogError>>,
    },
    /// Which of these handles are unknown? (input validation)
    Missing {
        ids: Vec<ArtifactId>,
        reply: RpcReplyPort<Vec<ArtifactId>>,
    },
    /// Snapshot-consistent root view for queries and generators
    Snapshot { reply: RpcReplyPort<Bundle> },
    /// Retain a terminal task as a historical record
    RecordTask { record: TaskRecord },
    /// Queryable log of terminal task outcomes, in completion order
    Outcomes {
        reply: RpcReplyPort<Vec<TaskRecord>>,
    },
    /// Persist the index now (teardown path)
    Flush {
        reply: RpcReplyPort<Result<(), CatalogError>>,
    },
}

#[derive(Debug, Clone)]
pub struct CatalogArguments {
    pub event_engine: ActorRef<EventEngineMsg>,
    /// JSON snapshot location; `None` disables persistence
    pub persist_path: Option<PathBuf>,
}

pub struct CatalogState {
    artifacts: HashMap<ArtifactId, Arc<Artifact>>,
    /// Commit order; drives the snapshot arena
    order: Vec<ArtifactId>,
    records: Vec<TaskRecord>,
    next_seq: u64,
    event_engine: ActorRef<EventEngineMsg>,
    persist_path: Option<PathBuf>,
}

/// On-disk snapshot format, keyed by artifact/task id
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCatalog {
    artifacts: Vec<Artifact>,
    records: Vec<TaskRecord>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct CatalogActor;

#[async_trait]
impl Actor for CatalogActor {
    type Msg = CatalogMsg;
    type State = CatalogState;
    type Arguments = CatalogArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut state = CatalogState {
            artifacts: HashMap::new(),
            order: Vec::new(),
            records: Vec::new(),
            next_seq: 0,
            event_engine: args.event_engine,
            persist_path: args.persist_path,
        };

        if let Some(path) = state.persist_path.clone() {
            if path.exists() {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    ActorProcessingErr::from(format!(
                        "failed to read catalog snapshot {}: {e}",
                        path.display()
                    ))
                })?;
                let persisted: PersistedCatalog = serde_json::from_str(&raw).map_err(|e| {
                    ActorProcessingErr::from(format!(
                        "corrupt catalog snapshot {}: {e}",
                        path.display()
                    ))
                })?;
                for artifact in persisted.artifacts {
                    state.order.push(artifact.id.clone());
                    state.artifacts.insert(artifact.id.clone(), Arc::new(artifact));
                }
                state.records = persisted.records;
                state.next_seq = persisted.next_seq;
                tracing::info!(
                    actor_id = %myself.get_id(),
                    path = %path.display(),
                    artifacts = state.order.len(),
                    records = state.records.len(),
                    "CatalogActor restored persisted state"
                );
            }
        }

        tracing::info!(
            actor_id = %myself.get_id(),
            artifacts = state.order.len(),
            "CatalogActor starting"
        );
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CatalogMsg::CommitOutputs {
                task_id,
                declared,
                drafts,
                reply,
            } => {
                let result = Self::commit_outputs(state, &task_id, &declared, drafts);
                let _ = reply.send(result);
            }
            CatalogMsg::Get { artifact_id, reply } => {
                let result = state
                    .artifacts
                    .get(&artifact_id)
                    .cloned()
                    .ok_or(CatalogError::NotFound(artifact_id));
                let _ = reply.send(result);
            }
            CatalogMsg::Missing { ids, reply } => {
                let missing = ids
                    .into_iter()
                    .filter(|id| !state.artifacts.contains_key(id))
                    .collect();
                let _ = reply.send(missing);
            }
            CatalogMsg::Snapshot { reply } => {
                let items: Vec<Arc<Artifact>> = state
                    .order
                    .iter()
                    .filter_map(|id| state.artifacts.get(id).cloned())
                    .collect();
                let _ = reply.send(Bundle::new(Arc::new(items), state.next_seq));
            }
            CatalogMsg::RecordTask { record } => {
                tracing::debug!(
                    task_id = %record.spec.id,
                    state = %record.state,
                    "recording terminal task"
                );
                state.records.push(record);
                Self::autosave(state);
            }
            CatalogMsg::Outcomes { reply } => {
                let _ = reply.send(state.records.clone());
            }
            CatalogMsg::Flush { reply } => {
                let _ = reply.send(Self::save(state));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Err(e) = Self::save(state) {
            tracing::warn!(error = %e, "catalog flush on stop failed");
        }
        tracing::info!(
            actor_id = %myself.get_id(),
            artifacts = state.order.len(),
            "CatalogActor stopped"
        );
        Ok(())
    }
}

impl CatalogActor {
    fn commit_outputs(
        state: &mut CatalogState,
        task_id: &TaskId,
        declared: &[OutputSlot],
        drafts: Vec<ArtifactDraft>,
    ) -> Result<Vec<ArtifactId>, CatalogError> {
        // Validate the whole batch before touching the arena: all-or-nothing.
        let declared_names: HashSet<&str> = declared.iter().map(|s| s.name.as_str()).collect();
        let mut seen_slots: HashSet<&str> = HashSet::new();
        for draft in &drafts {
            if !declared_names.contains(draft.slot.as_str()) {
                return Err(CatalogError::Consistency {
                    task_id: task_id.clone(),
                    detail: format!("undeclared output slot '{}'", draft.slot),
                });
            }
            if !seen_slots.insert(draft.slot.as_str()) {
                return Err(CatalogError::Consistency {
                    task_id: task_id.clone(),
                    detail: format!("duplicate output slot '{}'", draft.slot),
                });
            }
        }
        if seen_slots.len() != declared_names.len() {
            let missing: Vec<&str> = declared_names
                .difference(&seen_slots)
                .copied()
                .collect();
            return Err(CatalogError::Consistency {
                task_id: task_id.clone(),
                detail: format!("missing output slots {missing:?}"),
            });
        }

        let mut committed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            state.next_seq += 1;
            let artifact = Artifact {
                id: ArtifactId::new(),
                slot: draft.slot,
                kind: draft.kind,
                location: draft.location,
                size: draft.size,
                producer: task_id.clone(),
                supersedes: draft.supersedes,
                seq: state.next_seq,
                recorded_at: Utc::now(),
            };
            tracing::debug!(
                artifact_id = %artifact.id,
                task_id = %task_id,
                kind = %artifact.kind,
                seq = artifact.seq,
                "artifact recorded"
            );
            state.order.push(artifact.id.clone());
            committed.push(artifact.id.clone());
            let event = Event::catalog_changed(artifact.id.clone(), task_id.clone());
            state.artifacts.insert(artifact.id.clone(), Arc::new(artifact));
            if let Err(e) = event_engine::signal(&state.event_engine, event) {
                tracing::warn!(error = %e, "failed to signal catalog change");
            }
        }
        Self::autosave(state);
        Ok(committed)
    }

    fn save(state: &CatalogState) -> Result<(), CatalogError> {
        let Some(path) = &state.persist_path else {
            return Ok(());
        };
        let persisted = PersistedCatalog {
            artifacts: state
                .order
                .iter()
                .filter_map(|id| state.artifacts.get(id))
                .map(|a| a.as_ref().clone())
                .collect(),
            records: state.records.clone(),
            next_seq: state.next_seq,
        };
        let raw = serde_json::to_string_pretty(&persisted)
            .map_err(|e| CatalogError::Persist(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::Persist(e.to_string()))?;
        }
        std::fs::write(path, raw).map_err(|e| CatalogError::Persist(e.to_string()))
    }

    fn autosave(state: &CatalogState) {
        if let Err(e) = Self::save(state) {
            tracing::warn!(error = %e, "catalog autosave failed");
        }
    }
}

/// Snapshot-consistent view of the catalog.
pub async fn snapshot(catalog: &ActorRef<CatalogMsg>) -> Result<Bundle, ractor::RactorErr<CatalogMsg>> {
    ractor::call!(catalog, |reply| CatalogMsg::Snapshot { reply })
}
