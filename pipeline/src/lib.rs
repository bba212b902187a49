// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! The per-task data plane: frame dispatch and the pipeline worker loop.
//!
//! A pipeline is a single execution context that pulls raw frames from one
//! queue, decodes and classifies them, and emits annotated records to the
//! task's shared send buffer. Dispatchers distribute frames across pipelines
//! by flow hash (preserving flow affinity) or round-robin. Every send toward
//! a sink is non-blocking: bounded queues drop on full rather than stall the
//! capture path.

mod dispatch;
mod worker;

pub use dispatch::{DispatchError, Dispatcher, flow_hash};
pub use worker::{Pipeline, PipelineCtrl};
