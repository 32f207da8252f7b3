//! EventEngineActor - the reactive core.
//!
//! Components register a [`Condition`] and receive a one-shot wakeup the
//! moment it becomes satisfied; producers signal events without knowing
//! who is waiting. The waiting set is an explicit registry, each entry
//! owning its own cancellation handle - there are no global subscriber
//! lists.
//!
//! Delivery contract:
//! - a satisfied registration fires exactly once and leaves the set
//! - `Now` never suspends: the wakeup is sent before `Register` replies
//! - `Never` only leaves the set through `Cancel`
//! - fan-out: one event can fire any number of registrations

use std::collections::VecDeque;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::Event;
use tokio::sync::oneshot;

use crate::condition::Condition;

/// Cancellation handle for one waiting registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "registration-{}", self.0)
    }
}

/// Wakeup delivered when a registered condition becomes satisfied
#[derive(Debug)]
pub struct Satisfied {
    pub registration: RegistrationId,
    /// The event that completed the condition; `None` when the condition
    /// was already satisfied at registration time (e.g. `Now`).
    pub last_event: Option<Event>,
}

/// Handle returned by `Register`: await `rx` to suspend until the
/// condition fires; keep `id` to cancel the wait.
#[derive(Debug)]
pub struct Registration {
    pub id: RegistrationId,
    pub rx: oneshot::Receiver<Satisfied>,
}

#[derive(Debug)]
pub enum EventEngineMsg {
    /// Suspend a logical continuation until `condition` is satisfied
    Register {
        condition: Condition,
        reply: RpcReplyPort<Registration>,
    },
    /// Deliver an event; re-evaluates exactly the interested waiters
    Signal { event: Event },
    /// Reap a waiting registration; its receiver resolves as cancelled
    Cancel { registration: RegistrationId },
    /// Bounded recent-event ring, for debugging
    History { reply: RpcReplyPort<Vec<Event>> },
    /// Current size of the waiting set
    WaitingCount { reply: RpcReplyPort<usize> },
}

#[derive(Debug, Clone)]
pub struct EventEngineArguments {
    pub history_limit: usize,
}

impl Default for EventEngineArguments {
    fn default() -> Self {
        Self { history_limit: 256 }
    }
}

struct Waiter {
    id: RegistrationId,
    condition: Condition,
    tx: oneshot::Sender<Satisfied>,
}

pub struct EventEngineState {
    next_id: u64,
    waiting: Vec<Waiter>,
    history: VecDeque<Event>,
    history_limit: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum EventEngineError {
    #[error("event engine rpc failed: {0}")]
    Rpc(String),
    #[error("registration was cancelled before the condition fired")]
    Cancelled,
}

#[derive(Debug, Default)]
pub struct EventEngineActor;

#[async_trait]
impl Actor for EventEngineActor {
    type Msg = EventEngineMsg;
    type State = EventEngineState;
    type Arguments = EventEngineArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            history_limit = args.history_limit,
            "EventEngineActor starting"
        );
        Ok(EventEngineState {
            next_id: 0,
            waiting: Vec::new(),
            history: VecDeque::new(),
            history_limit: args.history_limit.max(1),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventEngineMsg::Register { condition, reply } => {
                state.next_id += 1;
                let id = RegistrationId(state.next_id);
                let (tx, rx) = oneshot::channel();

                if condition.is_satisfied() {
                    // Now-like conditions: wake before the caller ever parks
                    let _ = tx.send(Satisfied {
                        registration: id,
                        last_event: None,
                    });
                    tracing::debug!(registration = %id, "condition satisfied at registration");
                } else {
                    state.waiting.push(Waiter { id, condition, tx });
                    tracing::debug!(
                        registration = %id,
                        waiting = state.waiting.len(),
                        "condition registered"
                    );
                }

                let _ = reply.send(Registration { id, rx });
            }
            EventEngineMsg::Signal { event } => {
                tracing::debug!(event_id = %event.id, kind = %event.kind, "signal");
                state.history.push_back(event.clone());
                while state.history.len() > state.history_limit {
                    state.history.pop_front();
                }

                let mut still_waiting = Vec::with_capacity(state.waiting.len());
                for mut waiter in state.waiting.drain(..) {
                    if waiter.tx.is_closed() {
                        // Waiter abandoned its receiver; reap silently
                        tracing::debug!(registration = %waiter.id, "reaping abandoned waiter");
                        continue;
                    }
                    if waiter.condition.wants(&event) {
                        waiter.condition.absorb(&event);
                        if waiter.condition.is_satisfied() {
                            tracing::debug!(
                                registration = %waiter.id,
                                event_id = %event.id,
                                "condition fired"
                            );
                            let _ = waiter.tx.send(Satisfied {
                                registration: waiter.id,
                                last_event: Some(event.clone()),
                            });
                            continue;
                        }
                    }
                    still_waiting.push(waiter);
                }
                state.waiting = still_waiting;
            }
            EventEngineMsg::Cancel { registration } => {
                let before = state.waiting.len();
                // Dropping the sender resolves the receiver as cancelled
                state.waiting.retain(|w| w.id != registration);
                if state.waiting.len() < before {
                    tracing::debug!(registration = %registration, "registration cancelled");
                } else {
                    tracing::debug!(
                        registration = %registration,
                        "cancel for unknown registration (already fired?)"
                    );
                }
            }
            EventEngineMsg::History { reply } => {
                let _ = reply.send(state.history.iter().cloned().collect());
            }
            EventEngineMsg::WaitingCount { reply } => {
                let _ = reply.send(state.waiting.len());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            abandoned = state.waiting.len(),
            "EventEngineActor stopped"
        );
        Ok(())
    }
}

/// Register a condition and return the wait handle.
pub async fn register(
    engine: &ActorRef<EventEngineMsg>,
    condition: Condition,
) -> Result<Registration, EventEngineError> {
    ractor::call!(engine, |reply| EventEngineMsg::Register {
        condition,
        reply
    })
    .map_err(|e| EventEngineError::Rpc(e.to_string()))
}

/// Register a condition and suspend until it fires.
///
/// This is the cooperative blocking primitive the brain is built on.
pub async fn wait_for(
    engine: &ActorRef<EventEngineMsg>,
    condition: Condition,
) -> Result<Satisfied, EventEngineError> {
    let registration = register(engine, condition).await?;
    registration
        .rx
        .await
        .map_err(|_| EventEngineError::Cancelled)
}

/// Fire-and-forget event delivery.
pub fn signal(
    engine: &ActorRef<EventEngineMsg>,
    event: Event,
) -> Result<(), EventEngineError> {
    engine
        .cast(EventEngineMsg::Signal { event })
        .map_err(|e| EventEngineError::Rpc(e.to_string()))
}
