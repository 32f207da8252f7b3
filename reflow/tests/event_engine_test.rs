//! EventEngineActor integration tests: exactly-once firing, Now/Never
//! semantics, fan-out delivery, cancellation, bounded history.

use std::time::Duration;

use ractor::Actor;
use reflow::actors::event_engine::{EventEngineActor, EventEngineArguments, EventEngineMsg};
use reflow::condition::Condition;
use shared_types::{Event, TaskId, TaskState};
use tokio::time::timeout;

async fn spawn_engine(history_limit: usize) -> ractor::ActorRef<EventEngineMsg> {
    let (engine, _handle) = Actor::spawn(None, EventEngineActor, EventEngineArguments {
        history_limit,
    })
    .await
    .expect("failed to spawn event engine");
    engine
}

async fn waiting_count(engine: &ractor::ActorRef<EventEngineMsg>) -> usize {
    ractor::call!(engine, |reply| EventEngineMsg::WaitingCount { reply }).expect("waiting count")
}

fn finished(state: TaskState) -> Event {
    Event::task_finished(TaskId::new(), state, "test")
}

#[tokio::test]
async fn now_resolves_without_suspension() {
    let engine = spawn_engine(16).await;

    let registration = reflow::actors::event_engine::register(&engine, Condition::Now)
        .await
        .expect("register");
    let satisfied = timeout(Duration::from_millis(100), registration.rx)
        .await
        .expect("Now must not suspend")
        .expect("sender dropped");

    assert!(satisfied.last_event.is_none());
    assert_eq!(waiting_count(&engine).await, 0);
}

#[tokio::test]
async fn never_fires_only_through_cancellation() {
    let engine = spawn_engine(16).await;

    let registration = reflow::actors::event_engine::register(&engine, Condition::Never)
        .await
        .expect("register");
    engine
        .cast(EventEngineMsg::Signal {
            event: finished(TaskState::Success),
        })
        .expect("signal");

    let mut rx = registration.rx;
    assert!(
        timeout(Duration::from_millis(100), &mut rx).await.is_err(),
        "Never must not fire on events"
    );

    engine
        .cast(EventEngineMsg::Cancel {
            registration: registration.id,
        })
        .expect("cancel");
    // Cancellation resolves the receiver as an error, not a wakeup
    assert!(rx.await.is_err());
    assert_eq!(waiting_count(&engine).await, 0);
}

#[tokio::test]
async fn threshold_fires_exactly_once_after_partial_signals() {
    let engine = spawn_engine(16).await;

    let registration =
        reflow::actors::event_engine::register(&engine, Condition::n_tasks_finished(2))
            .await
            .expect("register");

    engine
        .cast(EventEngineMsg::Signal {
            event: finished(TaskState::Success),
        })
        .expect("signal");
    let mut rx = registration.rx;
    assert!(
        timeout(Duration::from_millis(100), &mut rx).await.is_err(),
        "one completion must not satisfy a threshold of two"
    );
    assert_eq!(waiting_count(&engine).await, 1);

    engine
        .cast(EventEngineMsg::Signal {
            event: finished(TaskState::Failed),
        })
        .expect("signal");
    let satisfied = timeout(Duration::from_secs(1), &mut rx)
        .await
        .expect("threshold crossed")
        .expect("sender dropped");
    assert!(satisfied.last_event.is_some());

    // Fired registrations leave the waiting set; nothing to double-fire
    assert_eq!(waiting_count(&engine).await, 0);
    engine
        .cast(EventEngineMsg::Signal {
            event: finished(TaskState::Success),
        })
        .expect("signal");
    assert_eq!(waiting_count(&engine).await, 0);
}

#[tokio::test]
async fn completion_events_fan_out_to_all_interested_waiters() {
    let engine = spawn_engine(16).await;

    let first = reflow::actors::event_engine::register(&engine, Condition::n_tasks_finished(1))
        .await
        .expect("register");
    let second = reflow::actors::event_engine::register(&engine, Condition::n_tasks_finished(1))
        .await
        .expect("register");

    let event = finished(TaskState::Success);
    engine
        .cast(EventEngineMsg::Signal {
            event: event.clone(),
        })
        .expect("signal");

    let a = timeout(Duration::from_secs(1), first.rx)
        .await
        .expect("first waiter")
        .expect("sender dropped");
    let b = timeout(Duration::from_secs(1), second.rx)
        .await
        .expect("second waiter")
        .expect("sender dropped");
    assert_eq!(a.last_event.as_ref().map(|e| &e.id), Some(&event.id));
    assert_eq!(b.last_event.as_ref().map(|e| &e.id), Some(&event.id));
}

#[tokio::test]
async fn specific_task_wait_ignores_unrelated_completions() {
    let engine = spawn_engine(16).await;
    let mine = TaskId::new();

    let registration = reflow::actors::event_engine::register(
        &engine,
        Condition::tasks_done([mine.clone()]),
    )
    .await
    .expect("register");

    engine
        .cast(EventEngineMsg::Signal {
            event: finished(TaskState::Success),
        })
        .expect("signal");
    let mut rx = registration.rx;
    assert!(timeout(Duration::from_millis(100), &mut rx).await.is_err());

    engine
        .cast(EventEngineMsg::Signal {
            event: Event::task_finished(mine, TaskState::Failed, "test"),
        })
        .expect("signal");
    timeout(Duration::from_secs(1), &mut rx)
        .await
        .expect("watched task completion fires")
        .expect("sender dropped");
}

#[tokio::test]
async fn history_ring_is_bounded() {
    let engine = spawn_engine(3).await;

    for _ in 0..5 {
        engine
            .cast(EventEngineMsg::Signal {
                event: finished(TaskState::Success),
            })
            .expect("signal");
    }

    // Wait for one more registration round-trip so all signals are handled
    let _ = reflow::actors::event_engine::register(&engine, Condition::Now)
        .await
        .expect("register");

    let history =
        ractor::call!(&engine, |reply| EventEngineMsg::History { reply }).expect("history");
    assert_eq!(history.len(), 3);
}
