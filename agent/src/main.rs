// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(clippy::all, clippy::pedantic)]

mod args;
mod plugins;

use crate::args::{CmdArgs, Parser};
use config::AgentConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use task::TaskManager;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

fn load_config(args: &CmdArgs) -> Result<AgentConfig, String> {
    let raw = std::fs::read_to_string(&args.config)
        .map_err(|e| format!("cannot read {}: {e}", args.config.display()))?;
    let config: AgentConfig =
        serde_yaml_ng::from_str(&raw).map_err(|e| format!("bad configuration: {e}"))?;
    config
        .validate()
        .map_err(|e| format!("invalid configuration: {e}"))?;
    Ok(config)
}

fn main() {
    let args = CmdArgs::parse();
    init_logging(&args.log_filter);
    info!("starting siphon agent...");

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .expect("failed to set SIGINT handler");

    if let Some(addr) = args.metrics_addr {
        info!("exposing metrics on {addr}");
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            error!("failed to start metrics endpoint: {e}");
            std::process::exit(1);
        }
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let manager = match TaskManager::new(&args.agent_id, &config.daemon) {
        Ok(manager) => manager,
        Err(e) => {
            error!("cannot open task store: {e}");
            std::process::exit(1);
        }
    };

    match manager.restore() {
        Ok(0) => {}
        Ok(restored) => info!("restored {restored} task(s) from previous run"),
        Err(e) => warn!("task restore failed: {e}"),
    }

    for task in config.tasks {
        let id = task.id.clone();
        match manager.create(task) {
            Ok(()) => info!(task = %id, "task started"),
            Err(e) => error!(task = %id, "task failed to start: {e}"),
        }
    }

    if manager.list().is_empty() {
        warn!("no tasks are running; waiting for SIGINT anyway");
    }

    stop_rx.recv().expect("stop channel closed unexpectedly");
    info!("shutting down");
    manager.shutdown();
    info!("bye");
}
