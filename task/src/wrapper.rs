// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Size+timeout batching wrapper around a reporter, with optional fallback.
//!
//! Each wrapper runs an actor thread that owns its reporter instances.
//! Records and control commands share one ordered channel, so enqueue order
//! is preserved through to delivery. Closing the wrapper drains the channel,
//! flushes the residue, and stops the reporters.

use crate::error::TaskError;
use concurrency::CancelToken;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use plugin::{ConfigMap, OutputPacket, PluginError, Reporter};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Commands accepted by a wrapper actor.
pub enum WrapperCmd {
    Packet(OutputPacket),
    Pause,
    Resume,
    Reconfigure {
        cfg: ConfigMap,
        reply: Sender<Result<(), PluginError>>,
    },
}

/// Wrapper tuning, straight from the reporter's config entry.
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub task_id: String,
    pub reporter: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub queue_capacity: usize,
}

/// Control-side handle to one running wrapper actor.
#[derive(Debug)]
pub struct ReporterWrapper {
    reporter: String,
    tx: Option<Sender<WrapperCmd>>,
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl ReporterWrapper {
    /// Start the actor: the thread starts the reporter(s) and reports the
    /// outcome before this returns, so a start failure surfaces here with no
    /// thread left behind.
    ///
    /// # Errors
    ///
    /// Returns the reporter's start error.
    pub fn start(
        cfg: WrapperConfig,
        primary: Box<dyn Reporter>,
        fallback: Option<Box<dyn Reporter>>,
        cancel: &CancelToken,
    ) -> Result<Self, TaskError> {
        let (tx, rx) = bounded(cfg.queue_capacity);
        let (ready_tx, ready_rx) = bounded(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        let cancel = cancel.clone();
        let reporter = cfg.reporter.clone();
        let thread_name = format!("reporter-{}-{}", cfg.task_id, cfg.reporter);
        let join = concurrency::spawn_named(&thread_name, move || {
            let _done_tx = done_tx;
            Actor {
                cfg,
                primary,
                fallback,
                cancel,
            }
            .run(&rx, &ready_tx);
        })?;
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                reporter,
                tx: Some(tx),
                done_rx,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(TaskError::Plugin(e))
            }
            Err(_) => Err(TaskError::TaskStartFailed {
                id: reporter,
                reason: "reporter thread died during start".to_owned(),
            }),
        }
    }

    #[must_use]
    pub fn reporter(&self) -> &str {
        &self.reporter
    }

    /// Sender used by the task sender thread to enqueue records.
    #[must_use]
    pub fn packet_sender(&self) -> Option<Sender<WrapperCmd>> {
        self.tx.clone()
    }

    pub fn pause(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WrapperCmd::Pause);
        }
    }

    pub fn resume(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WrapperCmd::Resume);
        }
    }

    /// Apply a new config to the reporter, waiting for the actor's answer.
    ///
    /// # Errors
    ///
    /// Returns the reporter's reconfigure error, or nothing if the actor is
    /// already gone.
    pub fn reconfigure(&self, cfg: ConfigMap) -> Result<(), PluginError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = bounded(1);
        if tx
            .send(WrapperCmd::Reconfigure {
                cfg,
                reply: reply_tx,
            })
            .is_err()
        {
            return Ok(());
        }
        reply_rx.recv().unwrap_or(Ok(()))
    }

    /// Close the wrapper: stop accepting records, let the actor drain and
    /// flush, and wait for it up to `deadline`. A wedged reporter is
    /// abandoned with a warning rather than hanging the stop sequence.
    pub fn close(mut self, deadline: Duration) {
        drop(self.tx.take());
        match self.done_rx.recv_timeout(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(reporter = %self.reporter, "reporter did not stop within {deadline:?}, abandoning");
                drop(self.join.take());
            }
        }
    }
}

struct Actor {
    cfg: WrapperConfig,
    primary: Box<dyn Reporter>,
    fallback: Option<Box<dyn Reporter>>,
    cancel: CancelToken,
}

impl Actor {
    fn run(mut self, rx: &Receiver<WrapperCmd>, ready_tx: &Sender<Result<(), PluginError>>) {
        if let Err(e) = self.start_reporters() {
            let _ = ready_tx.send(Err(e));
            return;
        }
        let _ = ready_tx.send(Ok(()));

        let mut batch: Vec<OutputPacket> = Vec::with_capacity(self.cfg.batch_size);
        let mut deadline = Instant::now() + self.cfg.batch_timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(WrapperCmd::Packet(pkt)) => {
                    batch.push(pkt);
                    if batch.len() >= self.cfg.batch_size {
                        self.flush(&mut batch);
                        deadline = Instant::now() + self.cfg.batch_timeout;
                    }
                }
                Ok(WrapperCmd::Pause) => self.pause_reporters(),
                Ok(WrapperCmd::Resume) => self.resume_reporters(),
                Ok(WrapperCmd::Reconfigure { cfg, reply }) => {
                    let _ = reply.send(self.reconfigure_reporters(&cfg));
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.flush(&mut batch);
                    deadline = Instant::now() + self.cfg.batch_timeout;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Channel closed: flush the residue, then flush and stop the
        // reporters themselves.
        self.flush(&mut batch);
        if let Err(e) = self.primary.flush(&self.cancel) {
            stats::reporter_error(&self.cfg.task_id, &self.cfg.reporter, "flush");
            warn!(reporter = %self.cfg.reporter, "flush failed: {e}");
        }
        if let Err(e) = self.primary.stop(&self.cancel) {
            warn!(reporter = %self.cfg.reporter, "stop failed: {e}");
        }
        if let Some(fallback) = &mut self.fallback {
            if let Err(e) = fallback.flush(&self.cancel) {
                stats::reporter_error(&self.cfg.task_id, &self.cfg.reporter, "fallback_flush");
                warn!(reporter = %self.cfg.reporter, "fallback flush failed: {e}");
            }
            if let Err(e) = fallback.stop(&self.cancel) {
                warn!(reporter = %self.cfg.reporter, "fallback stop failed: {e}");
            }
        }
        debug!(reporter = %self.cfg.reporter, "reporter wrapper exiting");
    }

    fn start_reporters(&mut self) -> Result<(), PluginError> {
        self.primary.start(&self.cancel)?;
        if let Some(fallback) = &mut self.fallback {
            fallback.start(&self.cancel)?;
        }
        Ok(())
    }

    /// Deliver the batch: one batch call when the primary supports it,
    /// per-packet otherwise. Every packet reaches the primary or, on primary
    /// failure with a fallback configured, the fallback exactly once.
    fn flush(&mut self, batch: &mut Vec<OutputPacket>) {
        if batch.is_empty() {
            return;
        }
        stats::reporter_batch_size(&self.cfg.task_id, &self.cfg.reporter, batch.len());
        if self.primary.as_batch().is_some() {
            let result = self
                .primary
                .as_batch()
                .map_or(Ok(()), |batcher| batcher.report_batch(&self.cancel, batch));
            if let Err(e) = result {
                stats::reporter_error(&self.cfg.task_id, &self.cfg.reporter, "primary");
                debug!(reporter = %self.cfg.reporter, "batch report failed: {e}");
                for pkt in batch.iter() {
                    self.deliver_fallback(pkt);
                }
            }
        } else {
            for pkt in std::mem::take(batch) {
                if let Err(e) = self.primary.report(&self.cancel, &pkt) {
                    stats::reporter_error(&self.cfg.task_id, &self.cfg.reporter, "primary");
                    debug!(reporter = %self.cfg.reporter, "report failed: {e}");
                    self.deliver_fallback(&pkt);
                }
            }
        }
        batch.clear();
    }

    fn deliver_fallback(&mut self, pkt: &OutputPacket) {
        if let Some(fallback) = &mut self.fallback {
            if let Err(e) = fallback.report(&self.cancel, pkt) {
                stats::reporter_error(&self.cfg.task_id, &self.cfg.reporter, "fallback");
                debug!(reporter = %self.cfg.reporter, "fallback report failed: {e}");
            }
        }
    }

    fn pause_reporters(&mut self) {
        if let Some(pausable) = self.primary.as_pausable() {
            if let Err(e) = pausable.pause() {
                warn!(reporter = %self.cfg.reporter, "pause failed: {e}");
            }
        }
    }

    fn resume_reporters(&mut self) {
        if let Some(pausable) = self.primary.as_pausable() {
            if let Err(e) = pausable.resume() {
                warn!(reporter = %self.cfg.reporter, "resume failed: {e}");
            }
        }
    }

    fn reconfigure_reporters(&mut self, cfg: &ConfigMap) -> Result<(), PluginError> {
        match self.primary.as_reconfigurable() {
            Some(reconf) => reconf.reconfigure(cfg),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use plugin::{BatchReport, Plugin};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct SinkState {
        batches: Arc<Mutex<Vec<usize>>>,
        packets: Arc<Mutex<Vec<OutputPacket>>>,
        stopped: Arc<Mutex<bool>>,
    }

    struct BatchSink {
        state: SinkState,
        fail: bool,
    }

    impl Plugin for BatchSink {
        fn name(&self) -> &'static str {
            "batch-sink"
        }

        fn stop(&mut self, _cancel: &CancelToken) -> Result<(), PluginError> {
            *self.state.stopped.lock().unwrap() = true;
            Ok(())
        }
    }

    impl Reporter for BatchSink {
        fn report(&mut self, _cancel: &CancelToken, pkt: &OutputPacket) -> Result<(), PluginError> {
            if self.fail {
                return Err(PluginError::Failed("sink down".into()));
            }
            self.state.packets.lock().unwrap().push(pkt.clone());
            Ok(())
        }

        fn flush(&mut self, _cancel: &CancelToken) -> Result<(), PluginError> {
            Ok(())
        }

        fn as_batch(&mut self) -> Option<&mut dyn BatchReport> {
            Some(self)
        }
    }

    impl BatchReport for BatchSink {
        fn report_batch(
            &mut self,
            _cancel: &CancelToken,
            packets: &[OutputPacket],
        ) -> Result<(), PluginError> {
            if self.fail {
                return Err(PluginError::Failed("sink down".into()));
            }
            self.state.batches.lock().unwrap().push(packets.len());
            self.state.packets.lock().unwrap().extend_from_slice(packets);
            Ok(())
        }
    }

    struct PacketSink {
        state: SinkState,
    }

    impl Plugin for PacketSink {
        fn name(&self) -> &'static str {
            "packet-sink"
        }
    }

    impl Reporter for PacketSink {
        fn report(&mut self, _cancel: &CancelToken, pkt: &OutputPacket) -> Result<(), PluginError> {
            self.state.packets.lock().unwrap().push(pkt.clone());
            Ok(())
        }

        fn flush(&mut self, _cancel: &CancelToken) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct FailingStart;

    impl Plugin for FailingStart {
        fn name(&self) -> &'static str {
            "failing-start"
        }

        fn start(&mut self, _cancel: &CancelToken) -> Result<(), PluginError> {
            Err(PluginError::Failed("cannot connect".into()))
        }
    }

    impl Reporter for FailingStart {
        fn report(&mut self, _cancel: &CancelToken, _pkt: &OutputPacket) -> Result<(), PluginError> {
            Ok(())
        }

        fn flush(&mut self, _cancel: &CancelToken) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn packet(n: usize) -> OutputPacket {
        #[allow(clippy::cast_possible_truncation)]
        let dst_port = n as u16;
        OutputPacket {
            envelope: plugin::Envelope::new("t1", "a1", 0, std::time::SystemTime::UNIX_EPOCH),
            five_tuple: plugin::FiveTuple {
                src_ip: std::net::Ipv4Addr::new(10, 0, 0, 1).into(),
                dst_ip: std::net::Ipv4Addr::new(10, 0, 0, 2).into(),
                src_port: 1000,
                dst_port,
                protocol: 17,
            },
            labels: plugin::Labels::new(),
            payload_type: "raw".into(),
            payload: serde_json::Value::Null,
            raw: None,
        }
    }

    fn cfg(batch_size: usize, timeout: Duration) -> WrapperConfig {
        WrapperConfig {
            task_id: "t1".into(),
            reporter: "sink".into(),
            batch_size,
            batch_timeout: timeout,
            queue_capacity: 64,
        }
    }

    #[test]
    fn batches_by_size() {
        let state = SinkState::default();
        let wrapper = ReporterWrapper::start(
            cfg(5, Duration::from_secs(1)),
            Box::new(BatchSink {
                state: state.clone(),
                fail: false,
            }),
            None,
            &CancelToken::new(),
        )
        .unwrap();
        let tx = wrapper.packet_sender().unwrap();
        for n in 0..10 {
            tx.send(WrapperCmd::Packet(packet(n))).unwrap();
        }
        drop(tx);
        wrapper.close(Duration::from_secs(5));
        assert_eq!(*state.batches.lock().unwrap(), vec![5, 5]);
        assert_eq!(state.packets.lock().unwrap().len(), 10);
        assert!(*state.stopped.lock().unwrap());
    }

    #[test]
    fn flushes_on_timeout() {
        let state = SinkState::default();
        let wrapper = ReporterWrapper::start(
            cfg(100, Duration::from_millis(50)),
            Box::new(BatchSink {
                state: state.clone(),
                fail: false,
            }),
            None,
            &CancelToken::new(),
        )
        .unwrap();
        let tx = wrapper.packet_sender().unwrap();
        tx.send(WrapperCmd::Packet(packet(1))).unwrap();
        tx.send(WrapperCmd::Packet(packet(2))).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(*state.batches.lock().unwrap(), vec![2]);
        drop(tx);
        wrapper.close(Duration::from_secs(5));
    }

    #[test]
    fn close_flushes_residue_and_preserves_order() {
        let state = SinkState::default();
        let wrapper = ReporterWrapper::start(
            cfg(100, Duration::from_secs(30)),
            Box::new(BatchSink {
                state: state.clone(),
                fail: false,
            }),
            None,
            &CancelToken::new(),
        )
        .unwrap();
        let tx = wrapper.packet_sender().unwrap();
        for n in 0..7 {
            tx.send(WrapperCmd::Packet(packet(n))).unwrap();
        }
        drop(tx);
        wrapper.close(Duration::from_secs(5));
        let delivered = state.packets.lock().unwrap();
        let ports: Vec<u16> = delivered.iter().map(|p| p.five_tuple.dst_port).collect();
        assert_eq!(ports, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn primary_failure_routes_batch_to_fallback() {
        let primary_state = SinkState::default();
        let fallback_state = SinkState::default();
        let wrapper = ReporterWrapper::start(
            cfg(5, Duration::from_secs(1)),
            Box::new(BatchSink {
                state: primary_state.clone(),
                fail: true,
            }),
            Some(Box::new(PacketSink {
                state: fallback_state.clone(),
            })),
            &CancelToken::new(),
        )
        .unwrap();
        let tx = wrapper.packet_sender().unwrap();
        for n in 0..5 {
            tx.send(WrapperCmd::Packet(packet(n))).unwrap();
        }
        drop(tx);
        wrapper.close(Duration::from_secs(5));
        assert!(primary_state.packets.lock().unwrap().is_empty());
        assert_eq!(fallback_state.packets.lock().unwrap().len(), 5);
    }

    #[test]
    fn start_failure_surfaces_and_leaves_no_thread() {
        let err = ReporterWrapper::start(
            cfg(5, Duration::from_secs(1)),
            Box::new(FailingStart),
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::Plugin(PluginError::Failed(_))));
    }

    #[test]
    fn per_packet_primary_without_batch_capability() {
        let state = SinkState::default();
        let wrapper = ReporterWrapper::start(
            cfg(3, Duration::from_secs(1)),
            Box::new(PacketSink {
                state: state.clone(),
            }),
            None,
            &CancelToken::new(),
        )
        .unwrap();
        let tx = wrapper.packet_sender().unwrap();
        for n in 0..3 {
            tx.send(WrapperCmd::Packet(packet(n))).unwrap();
        }
        drop(tx);
        wrapper.close(Duration::from_secs(5));
        assert_eq!(state.packets.lock().unwrap().len(), 3);
    }
}
