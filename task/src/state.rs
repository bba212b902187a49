// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! The task state machine.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stats::StatusCode;
use tracing::info;

/// Lifecycle states of a task. `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Stopped | TaskState::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
            TaskState::Failed => "failed",
        }
    }

    #[must_use]
    pub fn status_code(self) -> StatusCode {
        match self {
            TaskState::Running => StatusCode::Running,
            TaskState::Paused => StatusCode::Paused,
            TaskState::Failed => StatusCode::Error,
            TaskState::Created | TaskState::Starting | TaskState::Stopping | TaskState::Stopped => {
                StatusCode::Stopped
            }
        }
    }

    fn can_transition(self, to: TaskState) -> bool {
        // Any non-terminal state may fail; a paused task may be stopped
        // directly, everything else follows the forward edges.
        matches!(
            (self, to),
            (TaskState::Created, TaskState::Starting)
                | (TaskState::Starting, TaskState::Running)
                | (TaskState::Running, TaskState::Paused)
                | (TaskState::Paused, TaskState::Running)
                | (
                    TaskState::Running | TaskState::Paused,
                    TaskState::Stopping
                )
                | (TaskState::Stopping, TaskState::Stopped)
        ) || (!self.is_terminal() && to == TaskState::Failed)
    }
}

/// Point-in-time view of a task's state and lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

struct Inner {
    state: TaskState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

type Observer = Box<dyn Fn(&StateSnapshot) + Send + Sync>;

/// State, timestamps, and the transition rules, behind one RW lock.
///
/// Transitions hold the write lock only for the update itself; logging, the
/// status gauge, and the persistence observer all run after it is released.
pub struct StateCell {
    task_id: String,
    inner: RwLock<Inner>,
    observer: Mutex<Option<Observer>>,
}

impl StateCell {
    #[must_use]
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_owned(),
            inner: RwLock::new(Inner {
                state: TaskState::Created,
                created_at: Utc::now(),
                started_at: None,
                stopped_at: None,
                failure_reason: None,
            }),
            observer: Mutex::new(None),
        }
    }

    /// Install the transition observer (used for persistence).
    pub fn set_observer(&self, observer: Observer) {
        *self.observer.lock() = Some(observer);
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.read().state
    }

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read();
        StateSnapshot {
            state: inner.state,
            created_at: inner.created_at,
            started_at: inner.started_at,
            stopped_at: inner.stopped_at,
            failure_reason: inner.failure_reason.clone(),
        }
    }

    /// Move to `to`, enforcing the transition rules. Returns the previous
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] for edges outside the state
    /// machine.
    pub fn transition(&self, to: TaskState) -> Result<TaskState, TaskError> {
        self.transition_inner(to, None)
    }

    /// Transition to Failed, recording the reason. Already-terminal tasks are
    /// left untouched.
    pub fn fail(&self, reason: &str) {
        let _ = self.transition_inner(TaskState::Failed, Some(reason.to_owned()));
    }

    fn transition_inner(
        &self,
        to: TaskState,
        reason: Option<String>,
    ) -> Result<TaskState, TaskError> {
        let (from, snapshot) = {
            let mut inner = self.inner.write();
            let from = inner.state;
            if !from.can_transition(to) {
                return Err(TaskError::InvalidTransition { from, to });
            }
            inner.state = to;
            if to == TaskState::Running && inner.started_at.is_none() {
                inner.started_at = Some(Utc::now());
            }
            if to.is_terminal() {
                inner.stopped_at = Some(Utc::now());
            }
            if let Some(reason) = reason {
                inner.failure_reason = Some(reason);
            }
            let snapshot = StateSnapshot {
                state: to,
                created_at: inner.created_at,
                started_at: inner.started_at,
                stopped_at: inner.stopped_at,
                failure_reason: inner.failure_reason.clone(),
            };
            (from, snapshot)
        };
        info!(
            task = %self.task_id,
            from = from.as_str(),
            to = to.as_str(),
            reason = snapshot.failure_reason.as_deref().unwrap_or(""),
            "task state transition"
        );
        stats::task_status(&self.task_id, to.status_code());
        if let Some(observer) = self.observer.lock().as_ref() {
            observer(&snapshot);
        }
        Ok(from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn happy_path() {
        let cell = StateCell::new("t1");
        assert_eq!(cell.state(), TaskState::Created);
        cell.transition(TaskState::Starting).unwrap();
        cell.transition(TaskState::Running).unwrap();
        cell.transition(TaskState::Paused).unwrap();
        cell.transition(TaskState::Running).unwrap();
        cell.transition(TaskState::Stopping).unwrap();
        cell.transition(TaskState::Stopped).unwrap();
        let snap = cell.snapshot();
        assert!(snap.started_at.is_some());
        assert!(snap.stopped_at.is_some());
        assert_eq!(snap.state, TaskState::Stopped);
    }

    #[test]
    fn invalid_edges_are_rejected() {
        let cell = StateCell::new("t1");
        assert!(matches!(
            cell.transition(TaskState::Running),
            Err(TaskError::InvalidTransition {
                from: TaskState::Created,
                to: TaskState::Running
            })
        ));
        cell.transition(TaskState::Starting).unwrap();
        cell.transition(TaskState::Running).unwrap();
        cell.transition(TaskState::Stopping).unwrap();
        cell.transition(TaskState::Stopped).unwrap();
        // Terminal states accept nothing, not even Failed.
        assert!(cell.transition(TaskState::Starting).is_err());
        assert!(cell.transition(TaskState::Failed).is_err());
    }

    #[test]
    fn any_live_state_can_fail() {
        for setup in [TaskState::Starting, TaskState::Running] {
            let cell = StateCell::new("t1");
            cell.transition(TaskState::Starting).unwrap();
            if setup == TaskState::Running {
                cell.transition(TaskState::Running).unwrap();
            }
            cell.fail("capturer went away");
            let snap = cell.snapshot();
            assert_eq!(snap.state, TaskState::Failed);
            assert_eq!(snap.failure_reason.as_deref(), Some("capturer went away"));
        }
    }

    #[test]
    fn paused_can_stop_directly() {
        let cell = StateCell::new("t1");
        cell.transition(TaskState::Starting).unwrap();
        cell.transition(TaskState::Running).unwrap();
        cell.transition(TaskState::Paused).unwrap();
        cell.transition(TaskState::Stopping).unwrap();
        cell.transition(TaskState::Stopped).unwrap();
    }

    #[test]
    fn observer_sees_every_transition() {
        let cell = StateCell::new("t1");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        cell.set_observer(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        cell.transition(TaskState::Starting).unwrap();
        cell.transition(TaskState::Running).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
