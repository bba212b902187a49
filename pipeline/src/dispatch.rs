// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Flow-affine frame distribution across pipeline queues.

use concurrency::CancelToken;
use config::DispatchStrategy;
use crossbeam_channel::{Receiver, Sender, select};
use net::RawFrame;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// How many leading frame bytes the fallback hash covers.
const FALLBACK_HASH_LEN: usize = 64;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher needs at least one pipeline")]
    NoPipelines,
}

struct Fnv1a(u32);

impl Fnv1a {
    fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    fn write(&mut self, bytes: &[u8]) -> &mut Self {
        for &b in bytes {
            self.0 ^= u32::from(b);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
        self
    }

    fn finish(&self) -> u32 {
        self.0
    }
}

/// 32-bit FNV-1a over the frame's 5-tuple: source address bytes, source port
/// (big-endian), destination address bytes, destination port, protocol byte.
/// When the inline header walk fails at any stage, the first 64 bytes of the
/// frame are hashed verbatim instead.
#[must_use]
pub fn flow_hash(frame: &[u8]) -> u32 {
    if let Some(tuple) = extract_tuple(frame) {
        let mut h = Fnv1a::new();
        h.write(tuple.src)
            .write(&tuple.src_port)
            .write(tuple.dst)
            .write(&tuple.dst_port)
            .write(&[tuple.protocol]);
        h.finish()
    } else {
        let mut h = Fnv1a::new();
        h.write(&frame[..frame.len().min(FALLBACK_HASH_LEN)]);
        h.finish()
    }
}

struct TupleView<'a> {
    src: &'a [u8],
    dst: &'a [u8],
    src_port: [u8; 2],
    dst_port: [u8; 2],
    protocol: u8,
}

/// Minimal Ethernet + 802.1Q + IP + port walk; no allocation, no copies.
fn extract_tuple(frame: &[u8]) -> Option<TupleView<'_>> {
    let mut ether_type = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
    let mut offset = 14;
    while ether_type == 0x8100 || ether_type == 0x88A8 {
        ether_type = u16::from_be_bytes([*frame.get(offset + 2)?, *frame.get(offset + 3)?]);
        offset += 4;
    }
    let (src, dst, protocol, l4) = match ether_type {
        0x0800 => {
            let ihl = usize::from(*frame.get(offset)? & 0x0F) * 4;
            if ihl < 20 {
                return None;
            }
            let protocol = *frame.get(offset + 9)?;
            let src = frame.get(offset + 12..offset + 16)?;
            let dst = frame.get(offset + 16..offset + 20)?;
            (src, dst, protocol, offset + ihl)
        }
        0x86DD => {
            let protocol = *frame.get(offset + 6)?;
            let src = frame.get(offset + 8..offset + 24)?;
            let dst = frame.get(offset + 24..offset + 40)?;
            (src, dst, protocol, offset + 40)
        }
        _ => return None,
    };
    // TCP, UDP, and SCTP all carry the port pair up front.
    if !matches!(protocol, 6 | 17 | 132) {
        return None;
    }
    let ports = frame.get(l4..l4 + 4)?;
    Some(TupleView {
        src,
        dst,
        src_port: [ports[0], ports[1]],
        dst_port: [ports[2], ports[3]],
        protocol,
    })
}

/// Routes raw frames from one capture queue to N pipeline queues.
///
/// Sends never block: a full pipeline queue drops the frame and records a
/// `pipeline_full` event. Dropping the dispatcher closes every pipeline
/// queue it feeds.
#[derive(Debug)]
pub struct Dispatcher {
    task_id: String,
    strategy: DispatchStrategy,
    outputs: Vec<Sender<RawFrame>>,
    round_robin: AtomicUsize,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Refuses to dispatch into zero pipelines.
    pub fn new(
        task_id: &str,
        strategy: DispatchStrategy,
        outputs: Vec<Sender<RawFrame>>,
    ) -> Result<Self, DispatchError> {
        if outputs.is_empty() {
            return Err(DispatchError::NoPipelines);
        }
        Ok(Self {
            task_id: task_id.to_owned(),
            strategy,
            outputs,
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Pipeline index for one frame. Flow-hash keeps every frame of a
    /// 5-tuple on the same pipeline.
    #[must_use]
    pub fn select_pipeline(&self, frame: &RawFrame) -> usize {
        match self.strategy {
            DispatchStrategy::FlowHash => flow_hash(&frame.data) as usize % self.outputs.len(),
            DispatchStrategy::RoundRobin => {
                self.round_robin.fetch_add(1, Ordering::Relaxed) % self.outputs.len()
            }
        }
    }

    /// Route one frame. Returns false when the target queue was full.
    pub fn dispatch(&self, frame: RawFrame) -> bool {
        let index = self.select_pipeline(&frame);
        match self.outputs[index].try_send(frame) {
            Ok(()) => {
                trace!(pipeline = index, "dispatched frame");
                true
            }
            Err(_) => {
                stats::capture_drops(&self.task_id, stats::stage::PIPELINE_FULL, 1);
                false
            }
        }
    }

    /// Pump the capture queue until it closes or the token fires.
    pub fn run(&self, cancel: &CancelToken, input: &Receiver<RawFrame>) {
        loop {
            select! {
                recv(cancel.cancelled()) -> _ => break,
                recv(input) -> frame => match frame {
                    Ok(frame) => {
                        self.dispatch(frame);
                    }
                    Err(_) => break,
                },
            }
        }
        debug!(task = %self.task_id, "dispatcher exiting");
    }
}
