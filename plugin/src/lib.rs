// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! Plugin contracts and the global factory registry.
//!
//! Four roles plug into a task: capturers feed raw frames in, parsers
//! classify decoded packets, processors filter or enrich output records, and
//! reporters deliver them. Each role is a trait object with a narrow method
//! set; optional capabilities (batch reporting, pause/resume, reconfigure)
//! are separate traits probed at runtime.

mod labels;
mod record;
mod registry;
mod traits;

pub use labels::Labels;
pub use record::{Envelope, FiveTuple, OutputPacket};
pub use registry::{
    PLUGINS, PluginCtor, PluginKind, PluginRegistration, lookup, new_capturer, new_parser,
    new_processor, new_reporter,
};
pub use traits::{
    BatchReport, CaptureCounters, CaptureStats, Capturer, ConfigMap, Parser, Pausable,
    PausableCapture, Plugin, PluginError, Processor, Reconfigure, Reporter,
};
