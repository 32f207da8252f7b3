pub mod catalog;
pub mod event_engine;
pub mod scheduler;

pub use catalog::{CatalogActor, CatalogArguments, CatalogError, CatalogMsg};
pub use event_engine::{
    EventEngineActor, EventEngineArguments, EventEngineError, EventEngineMsg, Registration,
    RegistrationId, Satisfied,
};
pub use scheduler::{
    QueueStats, SchedulerActor, SchedulerArguments, SchedulerError, SchedulerMsg, TaskSnapshot,
};
