//! Reflow - reactive task-orchestration engine
//!
//! This crate provides the core of an adaptive, long-running workflow
//! system: an event/condition engine, a versioned artifact catalog with
//! lazy views, a worker scheduler over an opaque execution backend, and
//! the adaptive control loop ("brain") that ties generator output back
//! to task emission.

pub mod actors;
pub mod backend;
pub mod brain;
pub mod bundle;
pub mod condition;
pub mod config;
pub mod generator;
pub mod orchestrator;

pub use backend::{ExecutionBackend, ExecutionOutcome, LocalBackend};
pub use brain::{Brain, BrainError, BrainReport};
pub use bundle::Bundle;
pub use condition::Condition;
pub use config::EngineConfig;
pub use generator::{ClaimedInputs, GeneratorError, TaskGenerator};
pub use orchestrator::{Orchestrator, OrchestratorError};
