// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! The task sender: drains the shared send buffer into every reporter
//! wrapper.

use crate::wrapper::WrapperCmd;
use crossbeam_channel::{Receiver, Sender};
use plugin::OutputPacket;
use tracing::debug;

/// Pump records until the send buffer closes, then return. Runs after the
/// pipelines in the shutdown order, so everything the pipelines emitted is
/// fanned out before the wrappers are closed.
pub fn run_sender(task_id: &str, input: &Receiver<OutputPacket>, wrappers: &[Sender<WrapperCmd>]) {
    let Some((last, rest)) = wrappers.split_last() else {
        // No reporters; just drain.
        while input.recv().is_ok() {}
        return;
    };
    let mut enqueue_failures: u64 = 0;
    while let Ok(pkt) = input.recv() {
        for tx in rest {
            if tx.try_send(WrapperCmd::Packet(pkt.clone())).is_err() {
                enqueue_failures += 1;
                stats::reporter_error(task_id, "all", "enqueue_full");
            }
        }
        if last.try_send(WrapperCmd::Packet(pkt)).is_err() {
            enqueue_failures += 1;
            stats::reporter_error(task_id, "all", "enqueue_full");
        }
    }
    debug!(task = %task_id, enqueue_failures, "sender drained");
}
