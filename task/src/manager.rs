// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! The task manager: CRUD over live tasks plus durable records for
//! restart-after-crash.

use crate::collector::CollectInterval;
use crate::error::TaskError;
use crate::persist::{PersistedTask, RECORD_VERSION, TaskStore};
use crate::state::TaskState;
use crate::task::Task;
use chrono::{DateTime, Utc};
use config::{DaemonConfig, TaskConfig};
use parking_lot::RwLock;
use plugin::ConfigMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Externally visible view of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub id: String,
    pub state: TaskState,
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Stores active tasks by id and mirrors every state transition to disk.
pub struct TaskManager {
    agent_id: String,
    auto_restart: bool,
    max_history: usize,
    store: Arc<TaskStore>,
    interval: Arc<CollectInterval>,
    tasks: RwLock<HashMap<String, Arc<Task>>>,
}

impl TaskManager {
    /// Open the manager with the daemon's persistence and metrics settings.
    ///
    /// # Errors
    ///
    /// Fails when the persistence directory cannot be created.
    pub fn new(agent_id: &str, daemon: &DaemonConfig) -> Result<Self, TaskError> {
        let store = Arc::new(TaskStore::open(&daemon.persistence.dir)?);
        Ok(Self {
            agent_id: agent_id.to_owned(),
            auto_restart: daemon.persistence.auto_restart,
            max_history: daemon.persistence.max_history,
            store,
            interval: Arc::new(CollectInterval::new(Duration::from_secs(
                daemon.metrics.collect_interval,
            ))),
            tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Build, persist, and start a task.
    ///
    /// # Errors
    ///
    /// [`TaskError::TaskAlreadyExists`], construction errors, or the start
    /// failure (in which case the task stays registered in its Failed state).
    pub fn create(&self, config: TaskConfig) -> Result<(), TaskError> {
        self.create_with_restart(config, 0)
    }

    fn create_with_restart(&self, config: TaskConfig, restart_count: u32) -> Result<(), TaskError> {
        let id = config.id.clone();
        if self.tasks.read().contains_key(&id) {
            return Err(TaskError::TaskAlreadyExists(id));
        }
        let task = Arc::new(Task::build(
            config,
            &self.agent_id,
            restart_count,
            Arc::clone(&self.interval),
        )?);
        self.install_observer(&task);
        {
            let mut tasks = self.tasks.write();
            if tasks.contains_key(&id) {
                return Err(TaskError::TaskAlreadyExists(id));
            }
            tasks.insert(id, Arc::clone(&task));
        }
        task.start()
    }

    /// Every state transition writes the full record; a crash between
    /// transitions therefore restarts from the last durable state.
    fn install_observer(&self, task: &Arc<Task>) {
        let store = Arc::clone(&self.store);
        let config = task.config().clone();
        let restart_count = task.restart_count();
        task.state_cell().set_observer(Box::new(move |snapshot| {
            let record = PersistedTask {
                version: RECORD_VERSION.to_owned(),
                config: config.clone(),
                state: snapshot.state,
                created_at: snapshot.created_at,
                started_at: snapshot.started_at,
                stopped_at: snapshot.stopped_at,
                failure_reason: snapshot.failure_reason.clone(),
                restart_count,
            };
            if let Err(e) = store.save(&record) {
                warn!(task = %record.config.id, "failed to persist task record: {e}");
            }
        }));
    }

    /// Stop and unregister a task. Its terminal record stays on disk as
    /// history, subject to the history cap.
    ///
    /// # Errors
    ///
    /// [`TaskError::TaskNotFound`] or the stop failure.
    pub fn delete(&self, id: &str) -> Result<(), TaskError> {
        let task = self
            .tasks
            .write()
            .remove(id)
            .ok_or_else(|| TaskError::TaskNotFound(id.to_owned()))?;
        let result = task.stop();
        if let Err(e) = self.store.prune_history(self.max_history) {
            warn!("history pruning failed: {e}");
        }
        result
    }

    fn get(&self, id: &str) -> Result<Arc<Task>, TaskError> {
        self.tasks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound(id.to_owned()))
    }

    /// # Errors
    ///
    /// [`TaskError::TaskNotFound`] or an invalid state transition.
    pub fn pause(&self, id: &str) -> Result<(), TaskError> {
        self.get(id)?.pause()
    }

    /// # Errors
    ///
    /// [`TaskError::TaskNotFound`] or an invalid state transition.
    pub fn resume(&self, id: &str) -> Result<(), TaskError> {
        self.get(id)?.resume()
    }

    /// # Errors
    ///
    /// [`TaskError::TaskNotFound`], wrong state, or aggregated component
    /// errors.
    pub fn reconfigure(&self, id: &str, component: &str, cfg: &ConfigMap) -> Result<(), TaskError> {
        self.get(id)?.reconfigure(component, cfg)
    }

    /// # Errors
    ///
    /// [`TaskError::TaskNotFound`].
    pub fn status(&self, id: &str) -> Result<TaskStatus, TaskError> {
        let task = self.get(id)?;
        Ok(Self::status_of(&task))
    }

    #[must_use]
    pub fn list(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = self
            .tasks
            .read()
            .values()
            .map(|task| Self::status_of(task))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    fn status_of(task: &Arc<Task>) -> TaskStatus {
        let snapshot = task.state_cell().snapshot();
        TaskStatus {
            id: task.id().to_owned(),
            state: snapshot.state,
            restart_count: task.restart_count(),
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            stopped_at: snapshot.stopped_at,
            failure_reason: snapshot.failure_reason,
        }
    }

    /// Change the stats collection interval for every task; takes effect on
    /// each collector's next tick.
    pub fn set_metrics_interval(&self, interval: Duration) {
        self.interval.set(interval);
    }

    /// Re-create tasks whose last durable state was live (Running, Starting,
    /// or Stopping) when auto-restart is enabled; terminal records are kept
    /// as history and pruned oldest-first. Returns how many tasks restarted.
    ///
    /// # Errors
    ///
    /// Fails only when the record directory is unreadable; individual
    /// restore failures are logged and skipped.
    pub fn restore(&self) -> Result<usize, TaskError> {
        let records = self.store.load_all()?;
        let mut restored = 0;
        for record in records {
            let live = matches!(
                record.state,
                TaskState::Running | TaskState::Starting | TaskState::Stopping
            );
            if !live {
                continue;
            }
            if !self.auto_restart {
                info!(task = %record.config.id, "auto-restart disabled, leaving task stopped");
                continue;
            }
            info!(task = %record.config.id, restarts = record.restart_count + 1, "restoring task");
            match self.create_with_restart(record.config, record.restart_count + 1) {
                Ok(()) => restored += 1,
                Err(e) => warn!("task restore failed: {e}"),
            }
        }
        if let Err(e) = self.store.prune_history(self.max_history) {
            warn!("history pruning failed: {e}");
        }
        Ok(restored)
    }

    /// Stop every task. Used at daemon shutdown.
    pub fn shutdown(&self) {
        let tasks: Vec<Arc<Task>> = self.tasks.write().drain().map(|(_, task)| task).collect();
        for task in tasks {
            if let Err(e) = task.stop() {
                warn!(task = %task.id(), "stop during shutdown failed: {e}");
            }
        }
    }
}
