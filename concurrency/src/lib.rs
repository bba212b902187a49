// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! Shared concurrency primitives: a propagating cancellation token and a
//! named-thread spawn helper.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    // Dropped on cancel so that every receiver clone observes disconnection.
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// A clonable cancellation signal.
///
/// The token never carries data: the channel exists only so that blocked
/// workers can `select!` on [`CancelToken::cancelled`] alongside their input
/// channels. Once [`CancelToken::cancel`] runs, every pending and future
/// `recv` on the signal returns immediately.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Signal cancellation. Idempotent; wakes every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.tx.lock() {
            guard.take();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver to `select!` on; it becomes ready (disconnected) on cancel.
    #[must_use]
    pub fn cancelled(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let _ = self.inner.rx.recv();
    }

    /// Block until cancelled or `timeout` elapses. Returns true if cancelled.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.rx.recv_timeout(timeout) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => true,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Spawn an OS thread with the given name.
///
/// # Errors
///
/// Returns the underlying io error if the OS refuses to spawn the thread.
pub fn spawn_named<F, T>(name: &str, f: F) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new().name(name.to_owned()).spawn(f)
}
