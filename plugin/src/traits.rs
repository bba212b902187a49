// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

use crate::labels::Labels;
use crate::record::OutputPacket;
use concurrency::CancelToken;
use crossbeam_channel::Sender;
use flow::FlowRegistry;
use net::{DecodedPacket, RawFrame};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Plugin-specific configuration: the `config` map of a plugin entry in the
/// task config, passed through verbatim.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Errors surfaced by plugin resolution and plugin calls.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// No factory registered under this name.
    #[error("no {kind} plugin named '{name}'")]
    NotFound {
        kind: crate::registry::PluginKind,
        name: String,
    },
    /// The plugin rejected its configuration.
    #[error("plugin '{name}' failed to initialise: {reason}")]
    InitFailed { name: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Plugin-defined runtime failure.
    #[error("{0}")]
    Failed(String),
}

/// Counters snapshot returned by [`Capturer::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_if_dropped: u64,
}

/// Shared atomic counters for capturer implementations. The capture loop
/// adds to them from its own thread while the stats collector snapshots.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    if_dropped: AtomicU64,
}

impl CaptureCounters {
    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_if_dropped(&self, n: u64) {
        self.if_dropped.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            packets_received: self.received.load(Ordering::Relaxed),
            packets_dropped: self.dropped.load(Ordering::Relaxed),
            packets_if_dropped: self.if_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle shared by every plugin role.
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Apply the plugin's `config` map. Called exactly once, before any other
    /// method.
    ///
    /// # Errors
    ///
    /// Implementations return [`PluginError::InitFailed`] for bad options.
    fn init(&mut self, cfg: &ConfigMap) -> Result<(), PluginError> {
        let _ = cfg;
        Ok(())
    }

    /// Called when the owning task starts.
    ///
    /// # Errors
    ///
    /// A start failure aborts (and rolls back) the task start.
    fn start(&mut self, cancel: &CancelToken) -> Result<(), PluginError> {
        let _ = cancel;
        Ok(())
    }

    /// Called when the owning task stops, after all in-flight work drained.
    ///
    /// # Errors
    ///
    /// Stop failures are logged and counted, never escalated.
    fn stop(&mut self, cancel: &CancelToken) -> Result<(), PluginError> {
        let _ = cancel;
        Ok(())
    }
}

/// Pause capability for capturers, which are shared across threads.
pub trait PausableCapture: Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Pause capability for exclusively-owned plugins.
pub trait Pausable {
    /// # Errors
    ///
    /// Pause failures are aggregated by the task and reported together.
    fn pause(&mut self) -> Result<(), PluginError>;
    /// # Errors
    ///
    /// Resume failures are aggregated by the task and reported together.
    fn resume(&mut self) -> Result<(), PluginError>;
}

/// Hot-reconfiguration capability.
pub trait Reconfigure {
    /// # Errors
    ///
    /// Reconfigure failures are aggregated by the task and reported together.
    fn reconfigure(&mut self, cfg: &ConfigMap) -> Result<(), PluginError>;
}

/// Batch delivery capability for reporters.
pub trait BatchReport {
    /// Deliver a whole batch in one call.
    ///
    /// # Errors
    ///
    /// A batch failure makes the wrapper fall back per-packet, if a fallback
    /// reporter is configured.
    fn report_batch(
        &mut self,
        cancel: &CancelToken,
        packets: &[OutputPacket],
    ) -> Result<(), PluginError>;
}

/// A source of raw frames.
///
/// `capture` runs on a dedicated thread and blocks until cancelled; the
/// instance is shared behind an `Arc` so the stats collector can snapshot
/// counters concurrently.
pub trait Capturer: Plugin + Send + Sync {
    /// Blocking capture loop. Deliver frames to `out` until `cancel` fires
    /// or a fatal driver error occurs.
    ///
    /// # Errors
    ///
    /// An error returned while the task context is live transitions the task
    /// to Failed.
    fn capture(&self, cancel: &CancelToken, out: &Sender<RawFrame>) -> Result<(), PluginError>;

    /// Snapshot of the driver counters.
    fn stats(&self) -> CaptureStats;

    fn as_pausable(&self) -> Option<&dyn PausableCapture> {
        None
    }
}

/// An application-protocol classifier.
pub trait Parser: Plugin + Send {
    /// Fast, side-effect-free applicability check.
    fn can_handle(&self, pkt: &DecodedPacket) -> bool;

    /// Parse the packet into a typed payload and labels.
    ///
    /// # Errors
    ///
    /// A parse failure makes the pipeline fall through to the next parser.
    fn handle(&mut self, pkt: &DecodedPacket) -> Result<(serde_json::Value, Labels), PluginError>;

    /// Parsers returning true receive the task's flow registry in the wire
    /// phase, before any pipeline runs.
    fn needs_flow_registry(&self) -> bool {
        false
    }

    fn bind_flow_registry(&mut self, registry: Arc<FlowRegistry>) {
        let _ = registry;
    }

    fn as_pausable(&mut self) -> Option<&mut dyn Pausable> {
        None
    }

    fn as_reconfigurable(&mut self) -> Option<&mut dyn Reconfigure> {
        None
    }
}

/// A keep/drop (and enrichment) stage over output records.
pub trait Processor: Plugin + Send {
    /// Returns false to drop the record. May mutate labels.
    fn process(&mut self, pkt: &mut OutputPacket) -> bool;

    fn as_pausable(&mut self) -> Option<&mut dyn Pausable> {
        None
    }

    fn as_reconfigurable(&mut self) -> Option<&mut dyn Reconfigure> {
        None
    }
}

impl fmt::Debug for dyn Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Parser").field(&self.name()).finish()
    }
}

/// A delivery sink for output records.
pub trait Reporter: Plugin + Send {
    /// Deliver one record.
    ///
    /// # Errors
    ///
    /// Reporter errors are counted and optionally retried via a fallback;
    /// they never fail the task.
    fn report(&mut self, cancel: &CancelToken, pkt: &OutputPacket) -> Result<(), PluginError>;

    /// Push any buffered records to the sink.
    ///
    /// # Errors
    ///
    /// Flush errors are counted like report errors.
    fn flush(&mut self, cancel: &CancelToken) -> Result<(), PluginError>;

    fn as_batch(&mut self) -> Option<&mut dyn BatchReport> {
        None
    }

    fn as_pausable(&mut self) -> Option<&mut dyn Pausable> {
        None
    }

    fn as_reconfigurable(&mut self) -> Option<&mut dyn Reconfigure> {
        None
    }
}

impl fmt::Debug for dyn Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reporter").field(&self.name()).finish()
    }
}
