// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

pub use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Edge capture agent: captures live frames, classifies SIP/RTP traffic, and
/// ships annotated records to configured sinks.
#[derive(Debug, Parser)]
#[command(name = "siphon", version, about)]
pub struct CmdArgs {
    /// Path to the agent configuration file (YAML).
    #[arg(short, long, default_value = "siphon.yaml")]
    pub config: PathBuf,

    /// Identifier stamped into every record's envelope.
    #[arg(long, default_value = "siphon")]
    pub agent_id: String,

    /// Listen address for the Prometheus metrics endpoint; omit to disable.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Log filter, e.g. `info` or `debug,siphon_pipeline=trace`.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
