// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! Metric names and adapters for the capture engine.
//!
//! Every metric the engine emits goes through the helpers here so that the
//! name/label vocabulary stays in one place. Counter sources upstream of the
//! engine (kernel ring stats in particular) may reset; [`CounterDelta`]
//! absorbs resets instead of producing gigantic deltas.

use metrics::{counter, gauge, histogram};

/// Packets received per capturer, labelled (task, interface).
pub const CAPTURE_PACKETS_TOTAL: &str = "capture_packets_total";
/// Packets dropped before reaching a sink, labelled (task, stage).
pub const CAPTURE_DROPS_TOTAL: &str = "capture_drops_total";
/// Packets passing each pipeline stage, labelled (task, pipeline, stage).
pub const PIPELINE_PACKETS_TOTAL: &str = "pipeline_packets_total";
/// Stage latency histogram, labelled (task, stage).
pub const PIPELINE_LATENCY_SECONDS: &str = "pipeline_latency_seconds";
/// Task status gauge, labelled (task, status).
pub const TASK_STATUS: &str = "task_status";
/// Gauge of reassembly flows currently buffered.
pub const REASSEMBLY_ACTIVE_FRAGMENTS: &str = "reassembly_active_fragments";
/// Observed reporter batch sizes, labelled (task, reporter).
pub const REPORTER_BATCH_SIZE: &str = "reporter_batch_size";
/// Reporter failures, labelled (task, reporter, error_type).
pub const REPORTER_ERRORS_TOTAL: &str = "reporter_errors_total";
/// Flow registry entry count, labelled (task).
pub const FLOW_REGISTRY_SIZE: &str = "flow_registry_size";

/// Label values for pipeline stages and drop sites.
pub mod stage {
    pub const CAPTURE: &str = "capture";
    pub const DECODE: &str = "decode";
    pub const REASSEMBLY: &str = "reassembly";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const PARSE: &str = "parse";
    pub const PROCESS: &str = "process";
    pub const EMIT: &str = "emit";
    pub const TOTAL: &str = "total";
    pub const PIPELINE_FULL: &str = "pipeline_full";
    pub const SEND_BUFFER_FULL: &str = "send_buffer_full";
    pub const DRIVER: &str = "driver";
    pub const INTERFACE: &str = "interface";
}

/// Numeric task status values exported through [`TASK_STATUS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Stopped = 0,
    Running = 1,
    Error = 2,
    Paused = 3,
}

impl StatusCode {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            StatusCode::Stopped => "stopped",
            StatusCode::Running => "running",
            StatusCode::Error => "error",
            StatusCode::Paused => "paused",
        }
    }
}

pub fn capture_packets(task: &str, interface: &str, n: u64) {
    counter!(CAPTURE_PACKETS_TOTAL, "task" => task.to_owned(), "interface" => interface.to_owned())
        .increment(n);
}

pub fn capture_drops(task: &str, drop_stage: &str, n: u64) {
    counter!(CAPTURE_DROPS_TOTAL, "task" => task.to_owned(), "stage" => drop_stage.to_owned())
        .increment(n);
}

pub fn pipeline_packets(task: &str, pipeline_id: usize, pipeline_stage: &str, n: u64) {
    counter!(
        PIPELINE_PACKETS_TOTAL,
        "task" => task.to_owned(),
        "pipeline" => pipeline_id.to_string(),
        "stage" => pipeline_stage.to_owned()
    )
    .increment(n);
}

pub fn pipeline_latency(task: &str, latency_stage: &str, seconds: f64) {
    histogram!(PIPELINE_LATENCY_SECONDS, "task" => task.to_owned(), "stage" => latency_stage.to_owned())
        .record(seconds);
}

pub fn task_status(task: &str, status: StatusCode) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(TASK_STATUS, "task" => task.to_owned(), "status" => status.label())
        .set(status as i32 as f64);
}

pub fn reassembly_active_fragments(count: f64) {
    gauge!(REASSEMBLY_ACTIVE_FRAGMENTS).set(count);
}

pub fn reporter_batch_size(task: &str, reporter: &str, size: usize) {
    #[allow(clippy::cast_precision_loss)]
    histogram!(REPORTER_BATCH_SIZE, "task" => task.to_owned(), "reporter" => reporter.to_owned())
        .record(size as f64);
}

pub fn reporter_error(task: &str, reporter: &str, error_type: &str) {
    counter!(
        REPORTER_ERRORS_TOTAL,
        "task" => task.to_owned(),
        "reporter" => reporter.to_owned(),
        "error_type" => error_type.to_owned()
    )
    .increment(1);
}

pub fn flow_registry_size(task: &str, size: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(FLOW_REGISTRY_SIZE, "task" => task.to_owned()).set(size as f64);
}

/// Tracks the last observed value of a monotonic upstream counter and yields
/// per-interval deltas. A current value below the last one is treated as a
/// counter reset and the current value becomes the delta.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterDelta {
    last: u64,
}

impl CounterDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, current: u64) -> u64 {
        let delta = if current < self.last {
            current
        } else {
            current - self.last
        };
        self.last = current;
        delta
    }
}

/// Per-capturer delta state. Each capturer needs its own instance: sharing a
/// single `last` across capturers corrupts the deltas whenever a task runs
/// more than one capturer.
#[derive(Debug, Default)]
pub struct CaptureDelta {
    received: CounterDelta,
    dropped: CounterDelta,
    if_dropped: CounterDelta,
}

impl CaptureDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns (received, dropped, `if_dropped`) deltas since the last call.
    pub fn advance(&mut self, received: u64, dropped: u64, if_dropped: u64) -> (u64, u64, u64) {
        (
            self.received.advance(received),
            self.dropped.advance(dropped),
            self.if_dropped.advance(if_dropped),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn delta_accumulates() {
        let mut d = CounterDelta::new();
        assert_eq!(d.advance(10), 10);
        assert_eq!(d.advance(25), 15);
        assert_eq!(d.advance(25), 0);
    }

    #[test]
    fn delta_tolerates_reset() {
        let mut d = CounterDelta::new();
        assert_eq!(d.advance(1000), 1000);
        // Upstream restarted and counted 7 packets since.
        assert_eq!(d.advance(7), 7);
        assert_eq!(d.advance(10), 3);
    }

    #[test]
    fn capture_delta_is_independent_per_field() {
        let mut d = CaptureDelta::new();
        assert_eq!(d.advance(5, 1, 0), (5, 1, 0));
        assert_eq!(d.advance(9, 1, 2), (4, 0, 2));
    }

    #[test]
    fn status_codes() {
        assert_eq!(StatusCode::Stopped as i32, 0);
        assert_eq!(StatusCode::Running as i32, 1);
        assert_eq!(StatusCode::Error as i32, 2);
        assert_eq!(StatusCode::Paused as i32, 3);
        assert_eq!(StatusCode::Paused.label(), "paused");
    }
}
