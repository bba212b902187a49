// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! Task and daemon configuration.
//!
//! Every duration in configuration is a number of seconds (fractional where
//! sub-second resolution matters), so the whole tree is representable in both
//! the YAML agent config and the JSON task-record persistence format.

use net::Tunnel;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Plugin-specific options, passed to the plugin untouched.
pub type PluginOptions = serde_json::Map<String, serde_json::Value>;

/// The reasons a configuration may be rejected.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("task id must not be empty")]
    EmptyTaskId,
    #[error("a task with id '{0}' already exists in the config")]
    DuplicateTaskId(String),
    #[error("task '{0}': workers must be at least 1")]
    NoWorkers(String),
    #[error("task '{0}': capture plugin name must not be empty")]
    EmptyCaptureName(String),
    #[error("task '{0}': at least one reporter is required")]
    NoReporters(String),
    #[error("task '{task}': channel capacity '{channel}' must be positive")]
    BadChannelCapacity { task: String, channel: &'static str },
    #[error("task '{task}': reporter '{reporter}' batch_size must be positive")]
    BadBatchSize { task: String, reporter: String },
    #[error("task '{task}': reporter '{reporter}' batch_timeout must be positive")]
    BadBatchTimeout { task: String, reporter: String },
    #[error("task '{0}': max_reassemble_size must be within 1..=65535")]
    BadReassembleSize(String),
}

/// How raw frames reach the pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// N capturers, each bound to its own pipeline queue.
    #[default]
    Binding,
    /// One capturer feeding an in-process dispatcher.
    Dispatch,
}

/// How the dispatcher picks a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStrategy {
    #[default]
    FlowHash,
    RoundRobin,
}

/// The capture source of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub name: String,
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    #[serde(default)]
    pub dispatch_strategy: DispatchStrategy,
    #[serde(default)]
    pub config: PluginOptions,
}

/// Decoder options of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
    #[serde(default)]
    pub ip_reassembly: bool,
}

/// A parser or processor entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub config: PluginOptions,
}

/// A reporter entry with its batching knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReporterEntry {
    pub name: String,
    #[serde(default)]
    pub config: PluginOptions,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch flush timeout in seconds.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: f64,
    /// Name of a reporter plugin to fall back to on primary failure.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl ReporterEntry {
    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.batch_timeout.max(0.0))
    }
}

/// Bounded channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCapacityConfig {
    #[serde(default = "default_raw_stream")]
    pub raw_stream: usize,
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    #[serde(default = "default_capture_ch")]
    pub capture_ch: usize,
}

impl Default for ChannelCapacityConfig {
    fn default() -> Self {
        Self {
            raw_stream: default_raw_stream(),
            send_buffer: default_send_buffer(),
            capture_ch: default_capture_ch(),
        }
    }
}

/// IPv4 reassembly limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReassemblyOptions {
    /// Buffered fragments allowed per flow.
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
    /// Largest datagram the reassembler will produce, in bytes.
    #[serde(default = "default_max_reassemble_size")]
    pub max_reassemble_size: usize,
    /// Flow idle timeout in seconds.
    #[serde(default = "default_reassembly_timeout")]
    pub timeout: u64,
    /// Fragments allowed per source IP per window; 0 disables the limiter.
    #[serde(default)]
    pub max_frags_per_ip: u64,
    /// Rate limiter window in seconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window: u64,
}

impl Default for ReassemblyOptions {
    fn default() -> Self {
        Self {
            max_fragments: default_max_fragments(),
            max_reassemble_size: default_max_reassemble_size(),
            timeout: default_reassembly_timeout(),
            max_frags_per_ip: 0,
            rate_limit_window: default_rate_limit_window(),
        }
    }
}

impl ReassemblyOptions {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window)
    }
}

/// A complete task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub capture: CaptureConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub parsers: Vec<PluginEntry>,
    #[serde(default)]
    pub processors: Vec<PluginEntry>,
    pub reporters: Vec<ReporterEntry>,
    #[serde(default)]
    pub channel_capacity: ChannelCapacityConfig,
    #[serde(default)]
    pub reassembly: ReassemblyOptions,
}

impl TaskConfig {
    /// Check the structural constraints of this task definition.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::EmptyTaskId);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers(self.id.clone()));
        }
        if self.capture.name.is_empty() {
            return Err(ConfigError::EmptyCaptureName(self.id.clone()));
        }
        if self.reporters.is_empty() {
            return Err(ConfigError::NoReporters(self.id.clone()));
        }
        let capacities = [
            ("raw_stream", self.channel_capacity.raw_stream),
            ("send_buffer", self.channel_capacity.send_buffer),
            ("capture_ch", self.channel_capacity.capture_ch),
        ];
        for (channel, capacity) in capacities {
            if capacity == 0 {
                return Err(ConfigError::BadChannelCapacity {
                    task: self.id.clone(),
                    channel,
                });
            }
        }
        for reporter in &self.reporters {
            if reporter.batch_size == 0 {
                return Err(ConfigError::BadBatchSize {
                    task: self.id.clone(),
                    reporter: reporter.name.clone(),
                });
            }
            if reporter.batch_timeout <= 0.0 {
                return Err(ConfigError::BadBatchTimeout {
                    task: self.id.clone(),
                    reporter: reporter.name.clone(),
                });
            }
        }
        if self.reassembly.max_reassemble_size == 0 || self.reassembly.max_reassemble_size > 65535 {
            return Err(ConfigError::BadReassembleSize(self.id.clone()));
        }
        Ok(())
    }
}

/// Task persistence options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: default_persistence_dir(),
            auto_restart: true,
            max_history: default_max_history(),
        }
    }
}

/// Stats collection options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Capture stats collection interval in seconds; 0 means the default.
    #[serde(default = "default_collect_interval")]
    pub collect_interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collect_interval: default_collect_interval(),
        }
    }
}

/// Daemon-wide options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Root of the agent configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl AgentConfig {
    /// Validate the daemon config and every task, including id uniqueness.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !seen.insert(task.id.as_str()) {
                return Err(ConfigError::DuplicateTaskId(task.id.clone()));
            }
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> f64 {
    1.0
}

fn default_raw_stream() -> usize {
    1000
}

fn default_send_buffer() -> usize {
    10000
}

fn default_capture_ch() -> usize {
    1000
}

fn default_max_fragments() -> usize {
    100
}

fn default_max_reassemble_size() -> usize {
    65535
}

fn default_reassembly_timeout() -> u64 {
    60
}

fn default_rate_limit_window() -> u64 {
    10
}

fn default_persistence_dir() -> PathBuf {
    PathBuf::from("./tasks")
}

fn default_true() -> bool {
    true
}

fn default_max_history() -> usize {
    100
}

fn default_collect_interval() -> u64 {
    5
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_task() -> TaskConfig {
        serde_yaml_ng::from_str(
            r"
            id: t1
            capture:
              name: afpacket
            reporters:
              - name: console
            ",
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let task = minimal_task();
        assert_eq!(task.workers, 1);
        assert_eq!(task.capture.dispatch_mode, DispatchMode::Binding);
        assert_eq!(task.capture.dispatch_strategy, DispatchStrategy::FlowHash);
        assert_eq!(task.channel_capacity.raw_stream, 1000);
        assert_eq!(task.channel_capacity.send_buffer, 10000);
        assert_eq!(task.channel_capacity.capture_ch, 1000);
        assert_eq!(task.reassembly.max_fragments, 100);
        assert_eq!(task.reassembly.max_reassemble_size, 65535);
        assert_eq!(task.reassembly.timeout(), Duration::from_secs(60));
        assert_eq!(task.reassembly.max_frags_per_ip, 0);
        assert_eq!(task.reporters[0].batch_size, 100);
        assert_eq!(task.reporters[0].batch_timeout(), Duration::from_secs(1));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn full_task_parses() {
        let task: TaskConfig = serde_yaml_ng::from_str(
            r#"
            id: sip-capture
            workers: 4
            capture:
              name: afpacket
              dispatch_mode: dispatch
              dispatch_strategy: round-robin
              config:
                interfaces: ["eth0", "eth1"]
            decoder:
              tunnels: [vxlan, gre]
              ip_reassembly: true
            parsers:
              - name: sip
              - name: rtp
            processors:
              - name: filter
                config:
                  label: sip.method
                  equals: OPTIONS
                  action: drop
            reporters:
              - name: kafka
                batch_size: 500
                batch_timeout: 0.25
                fallback: console
            channel_capacity:
              raw_stream: 2048
            "#,
        )
        .unwrap();
        assert_eq!(task.workers, 4);
        assert_eq!(task.capture.dispatch_mode, DispatchMode::Dispatch);
        assert_eq!(task.capture.dispatch_strategy, DispatchStrategy::RoundRobin);
        assert_eq!(task.decoder.tunnels, vec![Tunnel::Vxlan, Tunnel::Gre]);
        assert!(task.decoder.ip_reassembly);
        assert_eq!(task.reporters[0].fallback.as_deref(), Some("console"));
        assert_eq!(
            task.reporters[0].batch_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(task.channel_capacity.raw_stream, 2048);
        assert_eq!(task.channel_capacity.send_buffer, 10000);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_tasks() {
        let mut task = minimal_task();
        task.workers = 0;
        assert_eq!(task.validate(), Err(ConfigError::NoWorkers("t1".into())));

        let mut task = minimal_task();
        task.id = String::new();
        assert_eq!(task.validate(), Err(ConfigError::EmptyTaskId));

        let mut task = minimal_task();
        task.reporters.clear();
        assert_eq!(task.validate(), Err(ConfigError::NoReporters("t1".into())));

        let mut task = minimal_task();
        task.channel_capacity.send_buffer = 0;
        assert_eq!(
            task.validate(),
            Err(ConfigError::BadChannelCapacity {
                task: "t1".into(),
                channel: "send_buffer"
            })
        );

        let mut task = minimal_task();
        task.reassembly.max_reassemble_size = 70000;
        assert_eq!(
            task.validate(),
            Err(ConfigError::BadReassembleSize("t1".into()))
        );
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let config = AgentConfig {
            daemon: DaemonConfig::default(),
            tasks: vec![minimal_task(), minimal_task()],
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateTaskId("t1".into()))
        );
    }

    #[test]
    fn task_config_round_trips_through_json() {
        let task = minimal_task();
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }
}
