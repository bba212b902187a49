// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

use crate::state::TaskState;
use config::ConfigError;
use pipeline::DispatchError;
use plugin::PluginError;

/// Task lifecycle and manager errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("task '{0}' already exists")]
    TaskAlreadyExists(String),
    #[error("task '{id}' failed to start: {reason}")]
    TaskStartFailed { id: String, reason: String },
    #[error("pipeline stopped")]
    PipelineStopped,
    #[error("daemon is not running")]
    DaemonNotRunning,
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },
    #[error("operation not allowed in state {0:?}")]
    WrongState(TaskState),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("task record encoding: {0}")]
    Record(#[from] serde_json::Error),
    #[error("partial failure: {}", .0.join("; "))]
    Aggregate(Vec<String>),
}
