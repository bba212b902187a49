// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Per-source-IP fragment admission control.

use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

struct Window {
    started_at: Instant,
    counts: HashMap<Ipv4Addr, u64, RandomState>,
}

/// Sliding single-window counter keyed by source IPv4.
///
/// The whole window rotates at once: when it expires, every counter is
/// discarded and the window restarts at the triggering call. A limit of zero
/// disables the limiter entirely.
pub struct FragmentRateLimiter {
    max_per_window: u64,
    window: Duration,
    state: Mutex<Window>,
    rejected: AtomicU64,
}

impl FragmentRateLimiter {
    #[must_use]
    pub fn new(max_per_window: u64, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            state: Mutex::new(Window {
                started_at: Instant::now(),
                counts: HashMap::default(),
            }),
            rejected: AtomicU64::new(0),
        }
    }

    /// Admit or refuse one fragment from `src` at time `now`.
    pub fn allow(&self, src: Ipv4Addr, now: Instant) -> bool {
        if self.max_per_window == 0 {
            return true;
        }
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.started_at) >= self.window {
            state.counts.clear();
            state.started_at = now;
        }
        let count = state.counts.entry(src).or_insert(0);
        *count += 1;
        if *count <= self.max_per_window {
            true
        } else {
            drop(state);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(%src, "fragment source over rate limit");
            false
        }
    }

    /// Total fragments refused since construction.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
