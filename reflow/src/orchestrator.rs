//! Orchestrator - the explicitly constructed process context.
//!
//! Owns the actor set (event engine, catalog, scheduler) and the spawn
//! order: the event engine first, then the catalog (which replays any
//! persisted state in `pre_start`, before a single generator condition
//! can be armed), then the scheduler. There are no ambient singletons;
//! every component receives its collaborators at construction.

use std::sync::Arc;

use ractor::{Actor, ActorRef};
use shared_types::{Event, TaskId, TaskRecord, TaskSpec, Worker, WorkerId};
use tokio::task::JoinHandle;

use crate::actors::catalog::{CatalogActor, CatalogArguments, CatalogMsg};
use crate::actors::event_engine::{
    self, EventEngineActor, EventEngineArguments, EventEngineError, EventEngineMsg, Registration,
    Satisfied,
};
use crate::actors::scheduler::{
    SchedulerActor, SchedulerArguments, SchedulerError, SchedulerMsg,
};
use crate::backend::ExecutionBackend;
use crate::bundle::Bundle;
use crate::condition::Condition;
use crate::config::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to spawn {actor}: {detail}")]
    Spawn { actor: &'static str, detail: String },

    #[error("orchestrator rpc failed: {0}")]
    Rpc(String),
}

pub struct Orchestrator {
    config: EngineConfig,
    event_engine: ActorRef<EventEngineMsg>,
    catalog: ActorRef<CatalogMsg>,
    scheduler: ActorRef<SchedulerMsg>,
    handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub async fn start(
        config: EngineConfig,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self, OrchestratorError> {
        tracing::info!("starting reflow orchestrator");

        let (event_engine, engine_handle) = Actor::spawn(
            None,
            EventEngineActor,
            EventEngineArguments {
                history_limit: config.event_history_limit,
            },
        )
        .await
        .map_err(|e| OrchestratorError::Spawn {
            actor: "event-engine",
            detail: e.to_string(),
        })?;

        let (catalog, catalog_handle) = Actor::spawn(
            None,
            CatalogActor,
            CatalogArguments {
                event_engine: event_engine.clone(),
                persist_path: config.persist_path.clone(),
            },
        )
        .await
        .map_err(|e| OrchestratorError::Spawn {
            actor: "catalog",
            detail: e.to_string(),
        })?;

        let (scheduler, scheduler_handle) = Actor::spawn(
            None,
            SchedulerActor,
            SchedulerArguments {
                backend,
                catalog: catalog.clone(),
                event_engine: event_engine.clone(),
                cancel_grace: config.cancel_grace(),
            },
        )
        .await
        .map_err(|e| OrchestratorError::Spawn {
            actor: "scheduler",
            detail: e.to_string(),
        })?;

        Ok(Self {
            config,
            event_engine,
            catalog,
            scheduler,
            handles: vec![engine_handle, catalog_handle, scheduler_handle],
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_engine(&self) -> ActorRef<EventEngineMsg> {
        self.event_engine.clone()
    }

    pub fn catalog(&self) -> ActorRef<CatalogMsg> {
        self.catalog.clone()
    }

    pub fn scheduler(&self) -> ActorRef<SchedulerMsg> {
        self.scheduler.clone()
    }

    pub async fn register_worker(&self, worker: Worker) -> Result<(), OrchestratorError> {
        self.scheduler
            .cast(SchedulerMsg::RegisterWorker { worker })
            .map_err(|e| OrchestratorError::Rpc(e.to_string()))
    }

    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        ractor::call!(&self.scheduler, |reply| SchedulerMsg::Submit { spec, reply })
            .map_err(|e| SchedulerError::Rpc(e.to_string()))?
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        ractor::call!(&self.scheduler, |reply| SchedulerMsg::Cancel {
            task_id,
            reply
        })
        .map_err(|e| SchedulerError::Rpc(e.to_string()))?
    }

    /// Snapshot-consistent catalog view
    pub async fn snapshot(&self) -> Result<Bundle, OrchestratorError> {
        ractor::call!(&self.catalog, |reply| CatalogMsg::Snapshot { reply })
            .map_err(|e| OrchestratorError::Rpc(e.to_string()))
    }

    /// Queryable log of terminal task outcomes
    pub async fn outcomes(&self) -> Result<Vec<TaskRecord>, OrchestratorError> {
        ractor::call!(&self.catalog, |reply| CatalogMsg::Outcomes { reply })
            .map_err(|e| OrchestratorError::Rpc(e.to_string()))
    }

    /// Register a condition and return the wait handle
    pub async fn register(&self, condition: Condition) -> Result<Registration, EventEngineError> {
        event_engine::register(&self.event_engine, condition).await
    }

    /// Register a condition and suspend until it fires
    pub async fn wait_for(&self, condition: Condition) -> Result<Satisfied, EventEngineError> {
        event_engine::wait_for(&self.event_engine, condition).await
    }

    /// Deliver an event to the engine
    pub fn signal(&self, event: Event) -> Result<(), EventEngineError> {
        event_engine::signal(&self.event_engine, event)
    }

    /// External stopping surface: observed by any registered
    /// `Condition::stop_requested()`
    pub fn request_stop(&self, source: impl Into<String>) -> Result<(), EventEngineError> {
        self.signal(Event::stop_requested(source))
    }

    /// Report a worker as unreachable
    pub fn report_worker_lost(&self, worker_id: WorkerId) -> Result<(), OrchestratorError> {
        self.scheduler
            .cast(SchedulerMsg::WorkerLost { worker_id })
            .map_err(|e| OrchestratorError::Rpc(e.to_string()))
    }

    /// Teardown: drain the scheduler, flush the catalog, stop the actors.
    /// Returns the tasks that were still in flight when draining began.
    pub async fn shutdown(self) -> Result<Vec<TaskId>, OrchestratorError> {
        let in_flight = ractor::call!(&self.scheduler, |reply| SchedulerMsg::Drain { reply })
            .map_err(|e| OrchestratorError::Rpc(e.to_string()))?;

        if let Ok(Err(e)) = ractor::call!(&self.catalog, |reply| CatalogMsg::Flush { reply }) {
            tracing::warn!(error = %e, "catalog flush during shutdown failed");
        }

        tracing::info!(in_flight = in_flight.len(), "orchestrator shutting down");
        self.scheduler.stop(None);
        self.catalog.stop(None);
        self.event_engine.stop(None);
        for handle in self.handles {
            let _ = handle.await;
        }
        Ok(in_flight)
    }
}
