// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! The single-threaded pipeline worker loop.

use concurrency::CancelToken;
use crossbeam_channel::{Receiver, Sender, TrySendError, never, select};
use net::{DecodeOptions, DecodedPacket, RawFrame};
use plugin::{
    ConfigMap, Envelope, FiveTuple, Labels, OutputPacket, Parser, PluginError, Processor,
};
use reassembly::{Reassembler, Reassembly, ReassemblyError};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Emit-queue drop warnings are sampled at this rate.
const DROP_WARN_SAMPLE: u64 = 1000;

/// Control messages delivered to a running pipeline between packets.
pub enum PipelineCtrl {
    /// Pause every parser and processor that supports pausing.
    Pause,
    /// Resume them, in reverse order.
    Resume,
    /// Apply a new config to the named parser or processor.
    Reconfigure {
        name: String,
        cfg: ConfigMap,
        reply: Sender<Result<(), PluginError>>,
    },
}

/// One sequential decode→parse→process→emit context.
pub struct Pipeline {
    pub task_id: String,
    pub agent_id: String,
    pub id: usize,
    pub decode_opts: DecodeOptions,
    pub reassembler: Option<Arc<Reassembler>>,
    pub parsers: Vec<Box<dyn Parser>>,
    pub processors: Vec<Box<dyn Processor>>,
    pub output: Sender<OutputPacket>,
}

impl Pipeline {
    /// Run until the input channel closes (after draining it) or the task is
    /// cancelled. Never blocks on the output side.
    pub fn run(
        mut self,
        cancel: &CancelToken,
        input: &Receiver<RawFrame>,
        ctrl: &Receiver<PipelineCtrl>,
    ) {
        let mut dropped_sends: u64 = 0;
        let mut ctrl = ctrl.clone();
        loop {
            select! {
                recv(cancel.cancelled()) -> _ => break,
                recv(ctrl) -> msg => match msg {
                    Ok(msg) => self.handle_ctrl(msg),
                    // Controller went away; stop selecting on it.
                    Err(_) => ctrl = never(),
                },
                recv(input) -> frame => match frame {
                    Ok(frame) => self.handle_frame(&frame, &mut dropped_sends),
                    Err(_) => break,
                },
            }
        }
        debug!(task = %self.task_id, pipeline = self.id, "pipeline exiting");
    }

    fn handle_ctrl(&mut self, msg: PipelineCtrl) {
        match msg {
            PipelineCtrl::Pause => {
                for parser in &mut self.parsers {
                    if let Some(pausable) = parser.as_pausable() {
                        if let Err(e) = pausable.pause() {
                            warn!(pipeline = self.id, "parser pause failed: {e}");
                        }
                    }
                }
                for processor in &mut self.processors {
                    if let Some(pausable) = processor.as_pausable() {
                        if let Err(e) = pausable.pause() {
                            warn!(pipeline = self.id, "processor pause failed: {e}");
                        }
                    }
                }
            }
            PipelineCtrl::Resume => {
                for processor in &mut self.processors {
                    if let Some(pausable) = processor.as_pausable() {
                        if let Err(e) = pausable.resume() {
                            warn!(pipeline = self.id, "processor resume failed: {e}");
                        }
                    }
                }
                for parser in &mut self.parsers {
                    if let Some(pausable) = parser.as_pausable() {
                        if let Err(e) = pausable.resume() {
                            warn!(pipeline = self.id, "parser resume failed: {e}");
                        }
                    }
                }
            }
            PipelineCtrl::Reconfigure { name, cfg, reply } => {
                let mut result = Ok(());
                for parser in &mut self.parsers {
                    if parser.name() == name.as_str() {
                        if let Some(reconf) = parser.as_reconfigurable() {
                            if let Err(e) = reconf.reconfigure(&cfg) {
                                result = Err(e);
                            }
                        }
                    }
                }
                for processor in &mut self.processors {
                    if processor.name() == name.as_str() {
                        if let Some(reconf) = processor.as_reconfigurable() {
                            if let Err(e) = reconf.reconfigure(&cfg) {
                                result = Err(e);
                            }
                        }
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    fn handle_frame(&mut self, frame: &RawFrame, dropped_sends: &mut u64) {
        let started = Instant::now();
        let decoded = match net::decode(&frame.data, frame.timestamp, &self.decode_opts) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(pipeline = self.id, "decode failed: {e}");
                stats::capture_drops(&self.task_id, stats::stage::DECODE, 1);
                return;
            }
        };
        stats::pipeline_latency(&self.task_id, stats::stage::DECODE, started.elapsed().as_secs_f64());
        stats::pipeline_packets(&self.task_id, self.id, stats::stage::DECODE, 1);

        // Fragments go through the reassembler; the frame that completes a
        // datagram continues with the reassembled payload.
        let mut reassembled_payload: Option<Vec<u8>> = None;
        let mut pkt = decoded;
        if pkt.is_fragment() {
            let Some(reassembler) = self.reassembler.as_ref() else {
                // Reassembly disabled: the fragment continues as-is and will
                // fall through the parser chain as a raw record.
                self.finish_frame(&pkt, started, dropped_sends);
                return;
            };
            let Some(l3_offset) = pkt.l3_offset else {
                stats::capture_drops(&self.task_id, stats::stage::REASSEMBLY, 1);
                return;
            };
            match reassembler.process(&frame.data[l3_offset..], Instant::now()) {
                Ok(Reassembly::Incomplete) => return,
                Ok(Reassembly::Complete(_)) => {
                    // MF=0 and offset 0: not actually fragmented.
                }
                Ok(Reassembly::Reassembled(payload)) => {
                    stats::pipeline_packets(&self.task_id, self.id, stats::stage::REASSEMBLY, 1);
                    let Some(mut ip) = pkt.ip.clone() else {
                        return;
                    };
                    ip.fragment = None;
                    reassembled_payload = Some(payload);
                    let Some(buf) = reassembled_payload.as_deref() else {
                        return;
                    };
                    let protocol = ip.protocol;
                    match net::decode_transport(&mut ip, protocol, buf, &self.decode_opts) {
                        Ok((transport, payload)) => {
                            pkt = DecodedPacket {
                                timestamp: frame.timestamp,
                                eth: pkt.eth.clone(),
                                ip: Some(ip),
                                transport,
                                payload,
                                l3_offset: pkt.l3_offset,
                                reassembled: true,
                            };
                        }
                        Err(e) => {
                            debug!(pipeline = self.id, "reassembled decode failed: {e}");
                            stats::capture_drops(&self.task_id, stats::stage::DECODE, 1);
                            return;
                        }
                    }
                }
                Err(e) => {
                    let drop_stage = match e {
                        ReassemblyError::RateLimitExceeded(_) => stats::stage::RATE_LIMIT,
                        _ => stats::stage::REASSEMBLY,
                    };
                    debug!(pipeline = self.id, "fragment refused: {e}");
                    stats::capture_drops(&self.task_id, drop_stage, 1);
                    return;
                }
            }
        }
        self.finish_frame(&pkt, started, dropped_sends);
    }

    /// Parse, process, and emit one decoded packet.
    fn finish_frame(&mut self, pkt: &DecodedPacket, started: Instant, dropped_sends: &mut u64) {
        let parse_start = Instant::now();
        let mut parsed: Option<(String, serde_json::Value, Labels)> = None;
        for parser in &mut self.parsers {
            if !parser.can_handle(pkt) {
                continue;
            }
            match parser.handle(pkt) {
                Ok((payload, labels)) => {
                    parsed = Some((parser.name().to_owned(), payload, labels));
                    break;
                }
                // A failed parser falls through to the next one.
                Err(e) => debug!(parser = parser.name(), "parse failed: {e}"),
            }
        }
        stats::pipeline_latency(
            &self.task_id,
            stats::stage::PARSE,
            parse_start.elapsed().as_secs_f64(),
        );
        stats::pipeline_packets(&self.task_id, self.id, stats::stage::PARSE, 1);
        let (payload_type, payload, labels) = parsed
            .unwrap_or_else(|| ("raw".to_owned(), serde_json::Value::Null, Labels::new()));

        let five_tuple = FiveTuple::from_decoded(pkt).unwrap_or(FiveTuple {
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
        });
        let mut record = OutputPacket {
            envelope: Envelope::new(&self.task_id, &self.agent_id, self.id, pkt.timestamp),
            five_tuple,
            labels,
            payload_type,
            payload,
            raw: (!pkt.payload.is_empty()).then(|| pkt.payload.to_vec()),
        };

        let process_start = Instant::now();
        for processor in &mut self.processors {
            if !processor.process(&mut record) {
                stats::capture_drops(&self.task_id, stats::stage::PROCESS, 1);
                return;
            }
        }
        stats::pipeline_latency(
            &self.task_id,
            stats::stage::PROCESS,
            process_start.elapsed().as_secs_f64(),
        );
        stats::pipeline_packets(&self.task_id, self.id, stats::stage::PROCESS, 1);

        match self.output.try_send(record) {
            Ok(()) => {
                stats::pipeline_packets(&self.task_id, self.id, stats::stage::EMIT, 1);
            }
            Err(TrySendError::Full(_)) => {
                stats::capture_drops(&self.task_id, stats::stage::SEND_BUFFER_FULL, 1);
                *dropped_sends += 1;
                if *dropped_sends % DROP_WARN_SAMPLE == 1 {
                    warn!(
                        task = %self.task_id,
                        pipeline = self.id,
                        dropped = *dropped_sends,
                        "send buffer full, dropping records"
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
        stats::pipeline_latency(
            &self.task_id,
            stats::stage::TOTAL,
            started.elapsed().as_secs_f64(),
        );
    }
}
