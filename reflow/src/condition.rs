//! Conditions: predicates over process state with explicit re-evaluation
//! triggers.
//!
//! A condition is a value, not a callback: it knows whether it is
//! currently satisfied, which events it wants to see, and how to fold a
//! relevant event into its progress. The event engine owns registration
//! and firing; conditions themselves never touch shared state.
//!
//! Once satisfied a condition stays satisfied. Re-arming means
//! registering a fresh condition value.

use std::collections::HashSet;

use shared_types::{Event, EventKind, EventKindTag, TaskId, TaskState};

#[derive(Debug, Clone)]
pub enum Condition {
    /// Always true; registering never suspends the caller
    Now,
    /// Never true; a registration against it must be explicitly cancelled
    Never,
    /// Satisfied by the next event of the given kind
    OnEvent { tag: EventKindTag, seen: bool },
    /// Count-threshold over task completions: satisfied once `threshold`
    /// distinct tasks (from `watched`, or any task when `None`) have
    /// finished, optionally counting successes only.
    TasksFinished {
        watched: Option<HashSet<TaskId>>,
        threshold: usize,
        require_success: bool,
        seen: HashSet<TaskId>,
    },
    /// Conjunction: satisfied when every child is satisfied
    All(Vec<Condition>),
    /// Disjunction: satisfied when any child is satisfied
    Any(Vec<Condition>),
}

impl Condition {
    pub fn on(tag: EventKindTag) -> Self {
        Condition::OnEvent { tag, seen: false }
    }

    /// "Any N tasks finished", regardless of outcome
    pub fn n_tasks_finished(threshold: usize) -> Self {
        Condition::TasksFinished {
            watched: None,
            threshold,
            require_success: false,
            seen: HashSet::new(),
        }
    }

    /// "Any N tasks succeeded"
    pub fn n_tasks_succeeded(threshold: usize) -> Self {
        Condition::TasksFinished {
            watched: None,
            threshold,
            require_success: true,
            seen: HashSet::new(),
        }
    }

    /// "All of these specific tasks finished"
    pub fn tasks_done(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        let watched: HashSet<TaskId> = tasks.into_iter().collect();
        Condition::TasksFinished {
            threshold: watched.len(),
            watched: Some(watched),
            require_success: false,
            seen: HashSet::new(),
        }
    }

    /// Convenience stopping condition for an external operator signal
    pub fn stop_requested() -> Self {
        Condition::on(EventKindTag::StopRequested)
    }

    pub fn all(children: impl IntoIterator<Item = Condition>) -> Self {
        Condition::All(children.into_iter().collect())
    }

    pub fn any(children: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Any(children.into_iter().collect())
    }

    pub fn is_satisfied(&self) -> bool {
        match self {
            Condition::Now => true,
            Condition::Never => false,
            Condition::OnEvent { seen, .. } => *seen,
            Condition::TasksFinished {
                threshold, seen, ..
            } => seen.len() >= *threshold,
            Condition::All(children) => children.iter().all(Condition::is_satisfied),
            Condition::Any(children) => children.iter().any(Condition::is_satisfied),
        }
    }

    /// Would this event advance the condition's progress?
    pub fn wants(&self, event: &Event) -> bool {
        match self {
            Condition::Now | Condition::Never => false,
            Condition::OnEvent { tag, seen } => !seen && event.tag() == *tag,
            Condition::TasksFinished {
                watched,
                require_success,
                seen,
                ..
            } => match &event.kind {
                EventKind::TaskFinished { task_id, state } => {
                    if seen.contains(task_id) {
                        return false;
                    }
                    if *require_success && *state != TaskState::Success {
                        return false;
                    }
                    match watched {
                        Some(set) => set.contains(task_id),
                        None => true,
                    }
                }
                _ => false,
            },
            Condition::All(children) | Condition::Any(children) => {
                children.iter().any(|c| c.wants(event))
            }
        }
    }

    /// Fold a relevant event into internal progress. Events the condition
    /// does not want are ignored, so callers may absorb unconditionally.
    pub fn absorb(&mut self, event: &Event) {
        if !self.wants(event) {
            return;
        }
        match self {
            Condition::Now | Condition::Never => {}
            Condition::OnEvent { seen, .. } => *seen = true,
            Condition::TasksFinished { seen, .. } => {
                if let EventKind::TaskFinished { task_id, .. } = &event.kind {
                    seen.insert(task_id.clone());
                }
            }
            Condition::All(children) | Condition::Any(children) => {
                for child in children.iter_mut() {
                    child.absorb(event);
                }
            }
        }
    }
}
