// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Periodic capture-stats collection.

use concurrency::CancelToken;
use flow::FlowRegistry;
use plugin::Capturer;
use stats::CaptureDelta;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::trace;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Shared, atomically-updatable collection interval. Zero means the default;
/// changes take effect on the next tick.
#[derive(Debug, Default)]
pub struct CollectInterval(AtomicU64);

impl CollectInterval {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let this = Self(AtomicU64::new(0));
        this.set(interval);
        this
    }

    pub fn set(&self, interval: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.0.store(interval.as_nanos() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> Duration {
        match self.0.load(Ordering::Relaxed) {
            0 => DEFAULT_INTERVAL,
            nanos => Duration::from_nanos(nanos),
        }
    }
}

/// Spawn the per-task stats collector.
///
/// Each capturer gets its own delta state: a shared last-value would corrupt
/// the deltas whenever a task runs more than one capturer (binding mode).
///
/// # Errors
///
/// Propagates the io error if the thread cannot be spawned.
pub fn spawn_collector(
    task_id: &str,
    interval: Arc<CollectInterval>,
    capturers: Vec<(String, Arc<dyn Capturer>)>,
    registry: Arc<FlowRegistry>,
    cancel: &CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    let task_id = task_id.to_owned();
    let cancel = cancel.clone();
    concurrency::spawn_named(&format!("stats-{task_id}"), move || {
        let mut deltas: Vec<CaptureDelta> =
            capturers.iter().map(|_| CaptureDelta::new()).collect();
        loop {
            if cancel.wait_timeout(interval.get()) {
                break;
            }
            for ((label, capturer), delta) in capturers.iter().zip(deltas.iter_mut()) {
                let snapshot = capturer.stats();
                let (received, dropped, if_dropped) = delta.advance(
                    snapshot.packets_received,
                    snapshot.packets_dropped,
                    snapshot.packets_if_dropped,
                );
                if received > 0 {
                    stats::capture_packets(&task_id, label, received);
                }
                if dropped > 0 {
                    stats::capture_drops(&task_id, stats::stage::DRIVER, dropped);
                }
                if if_dropped > 0 {
                    stats::capture_drops(&task_id, stats::stage::INTERFACE, if_dropped);
                }
                trace!(task = %task_id, label = %label, received, dropped, "capture stats tick");
            }
            stats::flow_registry_size(&task_id, registry.count());
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::Sender;
    use net::RawFrame;
    use plugin::{CaptureCounters, CaptureStats, Plugin, PluginError};

    struct FixedCapturer {
        counters: CaptureCounters,
    }

    impl Plugin for FixedCapturer {
        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    impl Capturer for FixedCapturer {
        fn capture(
            &self,
            _cancel: &CancelToken,
            _out: &Sender<RawFrame>,
        ) -> Result<(), PluginError> {
            Ok(())
        }

        fn stats(&self) -> CaptureStats {
            self.counters.snapshot()
        }
    }

    #[test]
    fn interval_zero_means_default() {
        let interval = CollectInterval::new(Duration::ZERO);
        assert_eq!(interval.get(), DEFAULT_INTERVAL);
        interval.set(Duration::from_millis(10));
        assert_eq!(interval.get(), Duration::from_millis(10));
    }

    #[test]
    fn collector_exits_on_cancel() {
        let capturer: Arc<dyn Capturer> = Arc::new(FixedCapturer {
            counters: CaptureCounters::default(),
        });
        let cancel = CancelToken::new();
        let handle = spawn_collector(
            "t1",
            Arc::new(CollectInterval::new(Duration::from_millis(5))),
            vec![("fixed0".to_owned(), capturer)],
            Arc::new(FlowRegistry::new()),
            &cancel,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        handle.join().unwrap();
    }
}
