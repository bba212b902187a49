// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! Task orchestration: lifecycle, reporter wrappers, stats collection, and
//! the persistent task manager.
//!
//! A task owns everything it needs: capturers, a dispatcher (in dispatch
//! mode), N pipelines, a shared send buffer, one batching wrapper per
//! reporter, a stats collector, and the reassembly sweeper. Components come
//! up in reverse dependency order (sinks first) and go down in forward order
//! (sources first), so nothing ever emits into a closed channel.

mod collector;
mod error;
mod manager;
mod persist;
mod sender;
mod state;
mod task;
mod wrapper;

pub use collector::CollectInterval;
pub use error::TaskError;
pub use manager::{TaskManager, TaskStatus};
pub use persist::{PersistedTask, RECORD_VERSION, TaskStore};
pub use state::{StateCell, StateSnapshot, TaskState};
pub use task::Task;
pub use wrapper::{ReporterWrapper, WrapperCmd, WrapperConfig};
