// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! One capture task: construction in seven phases, start in reverse
//! dependency order with rollback, stop in forward order with full drain.

use crate::collector::{CollectInterval, spawn_collector};
use crate::error::TaskError;
use crate::sender::run_sender;
use crate::state::{StateCell, TaskState};
use crate::wrapper::{ReporterWrapper, WrapperCmd, WrapperConfig};
use concurrency::CancelToken;
use config::{DispatchMode, TaskConfig};
use crossbeam_channel::{Receiver, Sender, bounded};
use flow::FlowRegistry;
use net::{DecodeOptions, RawFrame};
use parking_lot::Mutex;
use pipeline::{Dispatcher, Pipeline, PipelineCtrl};
use plugin::{
    Capturer, ConfigMap, OutputPacket, Parser, PluginKind, Processor, Reporter, lookup,
    new_capturer, new_parser, new_processor, new_reporter,
};
use reassembly::{Reassembler, ReassemblyConfig};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Budget for rolling back already-started reporters after a start failure.
const START_ROLLBACK_DEADLINE: Duration = Duration::from_secs(10);
/// Budget for each reporter's flush+stop during shutdown.
const REPORTER_STOP_DEADLINE: Duration = Duration::from_secs(5);
/// Reporter wrapper command queue depth.
const REPORTER_QUEUE_CAPACITY: usize = 10000;
/// Pipeline control channel depth.
const CTRL_QUEUE_CAPACITY: usize = 8;

struct ReporterSet {
    cfg: WrapperConfig,
    primary: Box<dyn Reporter>,
    fallback: Option<Box<dyn Reporter>>,
}

/// Everything built by the construction phases, consumed by `start`.
struct Assembled {
    pipelines: Vec<(Pipeline, Receiver<RawFrame>, Receiver<PipelineCtrl>)>,
    raw_txs: Vec<Sender<RawFrame>>,
    ctrl_txs: Vec<Sender<PipelineCtrl>>,
    capture_queue: Option<(Sender<RawFrame>, Receiver<RawFrame>)>,
    send_tx: Sender<OutputPacket>,
    send_rx: Receiver<OutputPacket>,
    reporters: Vec<ReporterSet>,
}

/// Live threads and channel ends of a started task.
struct Runtime {
    capture_threads: Vec<JoinHandle<()>>,
    dispatcher_thread: Option<JoinHandle<()>>,
    pipeline_threads: Vec<JoinHandle<()>>,
    sender_thread: Option<JoinHandle<()>>,
    collector_thread: Option<JoinHandle<()>>,
    sweeper_thread: Option<JoinHandle<()>>,
    wrappers: Vec<ReporterWrapper>,
    ctrl_txs: Vec<Sender<PipelineCtrl>>,
    send_tx: Option<Sender<OutputPacket>>,
}

/// An independently-configured capture job owning all of its resources.
pub struct Task {
    config: TaskConfig,
    state: Arc<StateCell>,
    /// Task context; stays live through drain, cancelled only after the
    /// sender finishes.
    cancel: CancelToken,
    /// Separate signal for capturers so ingress stops first.
    capture_cancel: CancelToken,
    registry: Arc<FlowRegistry>,
    reassembler: Option<Arc<Reassembler>>,
    capturers: Vec<Arc<dyn Capturer>>,
    interval: Arc<CollectInterval>,
    restart_count: u32,
    assembled: Mutex<Option<Assembled>>,
    runtime: Mutex<Option<Runtime>>,
}

impl Task {
    /// Phases 1-6: validate, resolve, construct, init, wire, assemble.
    /// Nothing is running yet when this returns; errors leave no side
    /// effects.
    ///
    /// # Errors
    ///
    /// Configuration and plugin resolution/init failures.
    pub fn build(
        config: TaskConfig,
        agent_id: &str,
        restart_count: u32,
        interval: Arc<CollectInterval>,
    ) -> Result<Task, TaskError> {
        // Phase 1: validate.
        config.validate()?;

        // Phase 2: resolve every factory up front, failing fast on unknown
        // names before anything is constructed.
        lookup(PluginKind::Capturer, &config.capture.name)?;
        for entry in &config.parsers {
            lookup(PluginKind::Parser, &entry.name)?;
        }
        for entry in &config.processors {
            lookup(PluginKind::Processor, &entry.name)?;
        }
        for reporter in &config.reporters {
            lookup(PluginKind::Reporter, &reporter.name)?;
            if let Some(fallback) = &reporter.fallback {
                lookup(PluginKind::Reporter, fallback)?;
            }
        }

        // Phase 3: construct.
        let capturer_count = match config.capture.dispatch_mode {
            DispatchMode::Binding => config.workers,
            DispatchMode::Dispatch => 1,
        };
        let mut capturers_raw: Vec<Box<dyn Capturer>> = Vec::with_capacity(capturer_count);
        for _ in 0..capturer_count {
            capturers_raw.push(new_capturer(&config.capture.name)?);
        }
        let mut parser_sets: Vec<Vec<Box<dyn Parser>>> = Vec::with_capacity(config.workers);
        let mut processor_sets: Vec<Vec<Box<dyn Processor>>> = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            parser_sets.push(
                config
                    .parsers
                    .iter()
                    .map(|entry| new_parser(&entry.name))
                    .collect::<Result<_, _>>()?,
            );
            processor_sets.push(
                config
                    .processors
                    .iter()
                    .map(|entry| new_processor(&entry.name))
                    .collect::<Result<_, _>>()?,
            );
        }
        let mut reporter_pairs: Vec<(Box<dyn Reporter>, Option<Box<dyn Reporter>>)> =
            Vec::with_capacity(config.reporters.len());
        for entry in &config.reporters {
            let primary = new_reporter(&entry.name)?;
            let fallback = match &entry.fallback {
                Some(name) => Some(new_reporter(name)?),
                None => None,
            };
            reporter_pairs.push((primary, fallback));
        }
        let registry = Arc::new(FlowRegistry::new());
        let reassembler = config.decoder.ip_reassembly.then(|| {
            Arc::new(Reassembler::new(ReassemblyConfig {
                max_fragments_per_flow: config.reassembly.max_fragments,
                max_reassembled_size: config.reassembly.max_reassemble_size,
                timeout: config.reassembly.timeout(),
                max_frags_per_ip: config.reassembly.max_frags_per_ip,
                rate_limit_window: config.reassembly.rate_limit_window(),
            }))
        });

        // Phase 4: init every instance with its config map.
        for capturer in &mut capturers_raw {
            capturer.init(&config.capture.config)?;
        }
        for set in &mut parser_sets {
            for (parser, entry) in set.iter_mut().zip(&config.parsers) {
                parser.init(&entry.config)?;
            }
        }
        for set in &mut processor_sets {
            for (processor, entry) in set.iter_mut().zip(&config.processors) {
                processor.init(&entry.config)?;
            }
        }
        let empty = ConfigMap::new();
        for ((primary, fallback), entry) in reporter_pairs.iter_mut().zip(&config.reporters) {
            primary.init(&entry.config)?;
            if let Some(fallback) = fallback {
                fallback.init(&empty)?;
            }
        }

        // Phase 5: wire shared resources into the parsers that declared the
        // dependency.
        for set in &mut parser_sets {
            for parser in set.iter_mut() {
                if parser.needs_flow_registry() {
                    parser.bind_flow_registry(Arc::clone(&registry));
                }
            }
        }

        // Phase 6: assemble pipelines, channels, and wrapper specs.
        let (send_tx, send_rx) = bounded(config.channel_capacity.send_buffer);
        let mut pipelines = Vec::with_capacity(config.workers);
        let mut raw_txs = Vec::with_capacity(config.workers);
        let mut ctrl_txs = Vec::with_capacity(config.workers);
        let decode_opts = DecodeOptions::with_tunnels(config.decoder.tunnels.clone());
        let processor_iter = processor_sets.into_iter();
        for (id, (parsers, processors)) in parser_sets.into_iter().zip(processor_iter).enumerate() {
            let (raw_tx, raw_rx) = bounded(config.channel_capacity.raw_stream);
            let (ctrl_tx, ctrl_rx) = bounded(CTRL_QUEUE_CAPACITY);
            raw_txs.push(raw_tx);
            ctrl_txs.push(ctrl_tx);
            pipelines.push((
                Pipeline {
                    task_id: config.id.clone(),
                    agent_id: agent_id.to_owned(),
                    id,
                    decode_opts: decode_opts.clone(),
                    reassembler: reassembler.clone(),
                    parsers,
                    processors,
                    output: send_tx.clone(),
                },
                raw_rx,
                ctrl_rx,
            ));
        }
        let capture_queue = match config.capture.dispatch_mode {
            DispatchMode::Binding => None,
            DispatchMode::Dispatch => Some(bounded(config.channel_capacity.capture_ch)),
        };
        let reporters = reporter_pairs
            .into_iter()
            .zip(&config.reporters)
            .map(|((primary, fallback), entry)| ReporterSet {
                cfg: WrapperConfig {
                    task_id: config.id.clone(),
                    reporter: entry.name.clone(),
                    batch_size: entry.batch_size,
                    batch_timeout: entry.batch_timeout(),
                    queue_capacity: REPORTER_QUEUE_CAPACITY,
                },
                primary,
                fallback,
            })
            .collect();

        Ok(Task {
            state: Arc::new(StateCell::new(&config.id)),
            cancel: CancelToken::new(),
            capture_cancel: CancelToken::new(),
            registry,
            reassembler,
            capturers: capturers_raw.into_iter().map(Arc::from).collect(),
            interval,
            restart_count,
            assembled: Mutex::new(Some(Assembled {
                pipelines,
                raw_txs,
                ctrl_txs,
                capture_queue,
                send_tx,
                send_rx,
                reporters,
            })),
            runtime: Mutex::new(None),
            config,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    #[must_use]
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    #[must_use]
    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    #[must_use]
    pub fn flow_registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Phase 7: start everything in reverse dependency order (reporters,
    /// wrappers, sender, pipelines, capturers). A reporter start failure
    /// rolls the already-started reporters back in reverse order under a
    /// deadline and fails the task; no thread is left running.
    ///
    /// # Errors
    ///
    /// [`TaskError::TaskStartFailed`] with the original reason.
    pub fn start(&self) -> Result<(), TaskError> {
        self.state.transition(TaskState::Starting)?;
        let Some(assembled) = self.assembled.lock().take() else {
            let err = TaskError::TaskStartFailed {
                id: self.config.id.clone(),
                reason: "task was already started".to_owned(),
            };
            self.state.fail(&err.to_string());
            return Err(err);
        };
        match self.start_inner(assembled) {
            Ok(runtime) => {
                *self.runtime.lock() = Some(runtime);
                self.state.transition(TaskState::Running)?;
                info!(task = %self.config.id, workers = self.config.workers, "task running");
                Ok(())
            }
            Err(e) => {
                self.state.fail(&e.to_string());
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn start_inner(&self, assembled: Assembled) -> Result<Runtime, TaskError> {
        let Assembled {
            pipelines,
            raw_txs,
            ctrl_txs,
            capture_queue,
            send_tx,
            send_rx,
            reporters,
        } = assembled;
        let task_id = self.config.id.clone();

        // Reporters and their wrappers come up first.
        let mut wrappers: Vec<ReporterWrapper> = Vec::with_capacity(reporters.len());
        for set in reporters {
            let reporter = set.cfg.reporter.clone();
            match ReporterWrapper::start(set.cfg, set.primary, set.fallback, &self.cancel) {
                Ok(wrapper) => wrappers.push(wrapper),
                Err(e) => {
                    warn!(task = %task_id, reporter = %reporter, "reporter start failed, rolling back");
                    let deadline = Instant::now() + START_ROLLBACK_DEADLINE;
                    for started in wrappers.into_iter().rev() {
                        started.close(deadline.saturating_duration_since(Instant::now()));
                    }
                    return Err(TaskError::TaskStartFailed {
                        id: task_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Sender.
        let wrapper_txs: Vec<Sender<WrapperCmd>> = wrappers
            .iter()
            .filter_map(ReporterWrapper::packet_sender)
            .collect();
        let sender_id = task_id.clone();
        let sender_thread = concurrency::spawn_named(&format!("sender-{task_id}"), move || {
            run_sender(&sender_id, &send_rx, &wrapper_txs);
        })?;

        // Pipelines.
        let mut pipeline_threads = Vec::with_capacity(pipelines.len());
        for (worker, input_rx, ctrl_rx) in pipelines {
            let cancel = self.cancel.clone();
            let name = format!("pipeline-{task_id}-{}", worker.id);
            pipeline_threads.push(concurrency::spawn_named(&name, move || {
                worker.run(&cancel, &input_rx, &ctrl_rx);
            })?);
        }

        // Collector and reassembly sweeper.
        let labelled: Vec<(String, Arc<dyn Capturer>)> = self
            .capturers
            .iter()
            .enumerate()
            .map(|(i, c)| (format!("{}-{i}", self.config.capture.name), Arc::clone(c)))
            .collect();
        let collector_thread = spawn_collector(
            &task_id,
            Arc::clone(&self.interval),
            labelled,
            Arc::clone(&self.registry),
            &self.cancel,
        )?;
        let sweeper_thread = match &self.reassembler {
            Some(reassembler) => Some(Reassembler::spawn_sweeper(reassembler, &self.cancel)?),
            None => None,
        };

        // Capturers last: ingress opens only once everything downstream is
        // ready.
        let mut capture_threads = Vec::new();
        let dispatcher_thread = if let Some((capture_tx, capture_rx)) = capture_queue {
            let dispatcher = Dispatcher::new(
                &task_id,
                self.config.capture.dispatch_strategy,
                raw_txs,
            )?;
            let cancel = self.cancel.clone();
            let dispatcher_thread =
                concurrency::spawn_named(&format!("dispatch-{task_id}"), move || {
                    dispatcher.run(&cancel, &capture_rx);
                })?;
            capture_threads.push(self.spawn_capture_thread(0, capture_tx)?);
            Some(dispatcher_thread)
        } else {
            for (i, raw_tx) in raw_txs.into_iter().enumerate() {
                capture_threads.push(self.spawn_capture_thread(i, raw_tx)?);
            }
            None
        };

        Ok(Runtime {
            capture_threads,
            dispatcher_thread,
            pipeline_threads,
            sender_thread: Some(sender_thread),
            collector_thread: Some(collector_thread),
            sweeper_thread,
            wrappers,
            ctrl_txs,
            send_tx: Some(send_tx),
        })
    }

    fn spawn_capture_thread(
        &self,
        index: usize,
        out: Sender<RawFrame>,
    ) -> Result<JoinHandle<()>, TaskError> {
        let capturer = Arc::clone(&self.capturers[index]);
        let cancel = self.capture_cancel.clone();
        let state = Arc::clone(&self.state);
        let task_id = self.config.id.clone();
        let name = format!("capture-{task_id}-{index}");
        Ok(concurrency::spawn_named(&name, move || {
            if let Err(e) = capturer.capture(&cancel, &out) {
                if cancel.is_cancelled() {
                    return;
                }
                // A capturer error with a live context is fatal to the task.
                warn!(task = %task_id, capturer = index, "capturer failed: {e}");
                state.fail(&format!("capturer {index}: {e}"));
            }
        })?)
    }

    /// Forward-order stop: capturers, raw streams, pipelines, send buffer,
    /// sender, context, reporters. Every queued item drains before the
    /// stage after it closes.
    ///
    /// # Errors
    ///
    /// Invalid-state transitions. A Failed task is torn down without
    /// touching the state machine.
    pub fn stop(&self) -> Result<(), TaskError> {
        let failed = self.state.state() == TaskState::Failed;
        if !failed {
            self.state.transition(TaskState::Stopping)?;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            self.teardown(runtime);
        }
        if !failed {
            self.state.transition(TaskState::Stopped)?;
        }
        Ok(())
    }

    fn teardown(&self, runtime: Runtime) {
        let Runtime {
            capture_threads,
            dispatcher_thread,
            pipeline_threads,
            sender_thread,
            collector_thread,
            sweeper_thread,
            wrappers,
            ctrl_txs,
            send_tx,
        } = runtime;

        // 1. Halt ingress.
        self.capture_cancel.cancel();
        // 2. Capture threads must be gone before their queues close; each
        // thread drops its own sender on exit, which is what closes the
        // stream.
        for thread in capture_threads {
            let _ = thread.join();
        }
        // 3. In dispatch mode the dispatcher sees the capture queue close
        // and shuts the raw streams as it exits.
        if let Some(thread) = dispatcher_thread {
            let _ = thread.join();
        }
        // 4. Pipelines drain their inputs and exit.
        drop(ctrl_txs);
        for thread in pipeline_threads {
            let _ = thread.join();
        }
        // 5. Close the send buffer; the sender drains what remains.
        drop(send_tx);
        // 6. Only after the sender confirms the drain is the task context
        // cancelled, so reporter calls during the drain saw a live context.
        if let Some(thread) = sender_thread {
            let _ = thread.join();
        }
        self.cancel.cancel();
        if let Some(thread) = collector_thread {
            let _ = thread.join();
        }
        if let Some(thread) = sweeper_thread {
            let _ = thread.join();
        }
        // 7. Flush and stop the reporters, bounded per reporter.
        for wrapper in wrappers {
            wrapper.close(REPORTER_STOP_DEADLINE);
        }
        info!(task = %self.config.id, "task torn down");
    }

    /// Pause: capturers first (halt ingress), then reporters, then parsers
    /// and processors.
    ///
    /// # Errors
    ///
    /// Only valid from Running.
    pub fn pause(&self) -> Result<(), TaskError> {
        self.state.transition(TaskState::Paused)?;
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return Ok(());
        };
        for capturer in &self.capturers {
            if let Some(pausable) = capturer.as_pausable() {
                pausable.pause();
            }
        }
        for wrapper in &runtime.wrappers {
            wrapper.pause();
        }
        for ctrl in &runtime.ctrl_txs {
            let _ = ctrl.send(PipelineCtrl::Pause);
        }
        Ok(())
    }

    /// Resume in the reverse order of [`Task::pause`].
    ///
    /// # Errors
    ///
    /// Only valid from Paused.
    pub fn resume(&self) -> Result<(), TaskError> {
        self.state.transition(TaskState::Running)?;
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return Ok(());
        };
        for ctrl in &runtime.ctrl_txs {
            let _ = ctrl.send(PipelineCtrl::Resume);
        }
        for wrapper in &runtime.wrappers {
            wrapper.resume();
        }
        for capturer in &self.capturers {
            if let Some(pausable) = capturer.as_pausable() {
                pausable.resume();
            }
        }
        Ok(())
    }

    /// Apply a new config to every component named `component` that supports
    /// reconfiguration, aggregating failures.
    ///
    /// # Errors
    ///
    /// [`TaskError::WrongState`] outside Running/Paused, or the aggregated
    /// component errors.
    pub fn reconfigure(&self, component: &str, cfg: &ConfigMap) -> Result<(), TaskError> {
        let state = self.state.state();
        if !matches!(state, TaskState::Running | TaskState::Paused) {
            return Err(TaskError::WrongState(state));
        }
        let mut errors = Vec::new();
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return Ok(());
        };
        for wrapper in &runtime.wrappers {
            if wrapper.reporter() == component {
                if let Err(e) = wrapper.reconfigure(cfg.clone()) {
                    errors.push(format!("reporter {component}: {e}"));
                }
            }
        }
        for (i, ctrl) in runtime.ctrl_txs.iter().enumerate() {
            let (reply_tx, reply_rx) = bounded(1);
            let sent = ctrl
                .send(PipelineCtrl::Reconfigure {
                    name: component.to_owned(),
                    cfg: cfg.clone(),
                    reply: reply_tx,
                })
                .is_ok();
            if sent {
                if let Ok(Err(e)) = reply_rx.recv() {
                    errors.push(format!("pipeline {i} {component}: {e}"));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TaskError::Aggregate(errors))
        }
    }
}
