// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! The reassembler: per-flow fragment buffering behind a two-level lock.

use crate::frag::{
    FragmentKey, FragmentList, HARD_FRAGMENT_CAP, MAX_DATAGRAM_SIZE, MAX_FRAG_OFFSET_UNITS,
};
use crate::limiter::FragmentRateLimiter;
use ahash::RandomState;
use concurrency::CancelToken;
use etherparse::Ipv4Header;
use etherparse::err::ipv4::HeaderSliceError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Interval between timeout sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Reassembler tuning.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Buffered fragments allowed per flow; 0 means the hard ceiling.
    pub max_fragments_per_flow: usize,
    /// Largest datagram the reassembler will produce.
    pub max_reassembled_size: usize,
    /// Idle age after which a flow is evicted.
    pub timeout: Duration,
    /// Fragments allowed per source IP per window; 0 disables the limiter.
    pub max_frags_per_ip: u64,
    /// Rate limiter window length.
    pub rate_limit_window: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_fragments_per_flow: 100,
            max_reassembled_size: MAX_DATAGRAM_SIZE,
            timeout: Duration::from_secs(60),
            max_frags_per_ip: 0,
            rate_limit_window: Duration::from_secs(10),
        }
    }
}

/// Why the reassembler refused a fragment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("bad ipv4 header: {0}")]
    BadHeader(&'static str),
    #[error("fragment carries no payload")]
    EmptyPayload,
    #[error("fragment offset {0} exceeds {MAX_FRAG_OFFSET_UNITS} units")]
    OffsetTooLarge(u16),
    #[error("fragment ends at {0}, past the {MAX_DATAGRAM_SIZE} byte datagram limit")]
    DatagramTooLong(usize),
    #[error("reassembled size {size} exceeds configured cap {max}")]
    Oversize { size: usize, max: usize },
    #[error("source {0} exceeded the fragment rate limit")]
    RateLimitExceeded(Ipv4Addr),
    #[error("flow exceeded {0} buffered fragments")]
    Limit(usize),
    #[error("fragment flow idle for more than {0:?}")]
    Timeout(Duration),
}

/// Outcome of feeding one IPv4 datagram to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly<'a> {
    /// The datagram was never fragmented; its payload is borrowed from the
    /// input buffer.
    Complete(&'a [u8]),
    /// The fragment was buffered; more are needed.
    Incomplete,
    /// This fragment completed the datagram.
    Reassembled(Vec<u8>),
}

type FlowMap = HashMap<FragmentKey, Arc<Mutex<FragmentList>>, RandomState>;

/// IPv4 reassembler.
///
/// Lock order is always outer map first, then the per-flow list, and the two
/// are never held across an eviction: eviction paths release the list lock
/// before taking the map lock and do not re-acquire.
pub struct Reassembler {
    cfg: ReassemblyConfig,
    limiter: FragmentRateLimiter,
    flows: Mutex<FlowMap>,
    active: AtomicUsize,
}

impl Reassembler {
    #[must_use]
    pub fn new(cfg: ReassemblyConfig) -> Self {
        let limiter = FragmentRateLimiter::new(cfg.max_frags_per_ip, cfg.rate_limit_window);
        Self {
            cfg,
            limiter,
            flows: Mutex::new(HashMap::default()),
            active: AtomicUsize::new(0),
        }
    }

    fn effective_flow_cap(&self) -> usize {
        match self.cfg.max_fragments_per_flow {
            0 => HARD_FRAGMENT_CAP,
            n => n.min(HARD_FRAGMENT_CAP),
        }
    }

    /// Feed one IPv4 datagram (header included) to the reassembler.
    ///
    /// Non-fragmented datagrams take a zero-copy fast path. Fragments are
    /// validated, rate-limited per source, then buffered; the call that
    /// completes a datagram gets the assembled payload back and the flow is
    /// evicted.
    ///
    /// # Errors
    ///
    /// Any validation failure is returned as a [`ReassemblyError`]; the
    /// fragment is then dropped but the flow (if any) stays intact, except
    /// for the over-limit case which evicts the whole flow.
    pub fn process<'a>(
        &self,
        ip_bytes: &'a [u8],
        now: Instant,
    ) -> Result<Reassembly<'a>, ReassemblyError> {
        let (hdr, _) = Ipv4Header::from_slice(ip_bytes).map_err(|e| match e {
            HeaderSliceError::Len(_) => ReassemblyError::BadHeader("buffer shorter than header"),
            HeaderSliceError::Content(_) => ReassemblyError::BadHeader("malformed header"),
        })?;
        let header_len = hdr.header_len();
        // Clamp a bogus declared total length to the buffer.
        let end = usize::from(hdr.total_len).clamp(header_len, ip_bytes.len());
        let payload = &ip_bytes[header_len..end];
        let offset_units = hdr.fragment_offset.value();

        if !hdr.more_fragments && offset_units == 0 {
            return Ok(Reassembly::Complete(payload));
        }
        if payload.is_empty() {
            return Err(ReassemblyError::EmptyPayload);
        }
        if offset_units > MAX_FRAG_OFFSET_UNITS {
            return Err(ReassemblyError::OffsetTooLarge(offset_units));
        }
        let offset = usize::from(offset_units) * 8;
        let frag_end = offset + payload.len();
        if frag_end > MAX_DATAGRAM_SIZE {
            return Err(ReassemblyError::DatagramTooLong(frag_end));
        }
        if frag_end > self.cfg.max_reassembled_size {
            return Err(ReassemblyError::Oversize {
                size: frag_end,
                max: self.cfg.max_reassembled_size,
            });
        }
        let src = Ipv4Addr::from(hdr.source);
        if !self.limiter.allow(src, now) {
            return Err(ReassemblyError::RateLimitExceeded(src));
        }

        let key = FragmentKey {
            src: hdr.source,
            dst: hdr.destination,
            protocol: hdr.protocol.0,
            id: hdr.identification,
        };
        let list = {
            let mut flows = self.flows.lock();
            match flows.entry(key) {
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
                Entry::Vacant(vacant) => {
                    let list = Arc::new(Mutex::new(FragmentList::new(now)));
                    vacant.insert(Arc::clone(&list));
                    let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
                    #[allow(clippy::cast_precision_loss)]
                    stats::reassembly_active_fragments(active as f64);
                    trace!(%src, id = key.id, "new fragment flow");
                    list
                }
            }
        };

        let mut guard = list.lock();
        guard.touch(now);
        let cap = self.effective_flow_cap();
        if guard.fragment_count() >= cap {
            drop(guard);
            self.evict(&key);
            return Err(ReassemblyError::Limit(cap));
        }
        guard.insert(offset, payload, !hdr.more_fragments);
        if guard.is_complete() {
            let assembled = guard.assemble();
            drop(guard);
            self.evict(&key);
            debug!(%src, id = key.id, len = assembled.len(), "datagram reassembled");
            return Ok(Reassembly::Reassembled(assembled));
        }
        Ok(Reassembly::Incomplete)
    }

    /// Number of flows currently buffered.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Fragments refused by the per-source rate limiter.
    #[must_use]
    pub fn rate_limited(&self) -> u64 {
        self.limiter.rejected()
    }

    /// Evict every flow idle for longer than the configured timeout.
    /// Returns the number of flows evicted.
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.cfg.timeout;
        let expired: Vec<FragmentKey> = {
            let flows = self.flows.lock();
            flows
                .iter()
                .filter(|(_, list)| {
                    now.saturating_duration_since(list.lock().last_seen) > timeout
                })
                .map(|(key, _)| *key)
                .collect()
        };
        for key in &expired {
            debug!(
                id = key.id,
                error = %ReassemblyError::Timeout(timeout),
                "evicting fragment flow"
            );
            self.evict(key);
        }
        expired.len()
    }

    /// Run the timeout sweeper until the token is cancelled.
    ///
    /// # Errors
    ///
    /// Propagates the io error if the sweeper thread cannot be spawned.
    pub fn spawn_sweeper(
        reassembler: &Arc<Self>,
        cancel: &CancelToken,
    ) -> std::io::Result<JoinHandle<()>> {
        let reassembler = Arc::clone(reassembler);
        let cancel = cancel.clone();
        concurrency::spawn_named("reassembly-sweeper", move || {
            while !cancel.wait_timeout(SWEEP_INTERVAL) {
                let evicted = reassembler.sweep(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "fragment sweep");
                }
            }
        })
    }

    fn evict(&self, key: &FragmentKey) {
        let removed = self.flows.lock().remove(key);
        if removed.is_some() {
            let active = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
            #[allow(clippy::cast_precision_loss)]
            stats::reassembly_active_fragments(active as f64);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const SRC: [u8; 4] = [192, 168, 1, 1];
    const DST: [u8; 4] = [192, 168, 1, 2];

    /// Raw IPv4/UDP datagram bytes with the given fragmentation fields.
    fn frag(src: [u8; 4], id: u16, offset_units: u16, mf: bool, payload: &[u8]) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        let total = 20 + payload.len() as u16;
        let mut buf = vec![0x45, 0x00];
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(&id.to_be_bytes());
        let frag_word = offset_units | if mf { 0x2000 } else { 0 };
        buf.extend_from_slice(&frag_word.to_be_bytes());
        buf.push(64);
        buf.push(17); // UDP
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&DST);
        buf.extend_from_slice(payload);
        buf
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(ReassemblyConfig::default())
    }

    #[test]
    fn whole_datagram_takes_fast_path() {
        let r = reassembler();
        let datagram = frag(SRC, 0x1234, 0, false, b"payload");
        match r.process(&datagram, Instant::now()).unwrap() {
            Reassembly::Complete(payload) => assert_eq!(payload, b"payload"),
            other => panic!("expected fast path, got {other:?}"),
        }
        assert_eq!(r.active_flows(), 0);
    }

    #[test]
    fn two_fragment_reassembly() {
        let r = reassembler();
        let now = Instant::now();
        let first: Vec<u8> = (0x00..0x50).collect();
        let second: Vec<u8> = (0x50..0xA0).collect();
        let f1 = frag(SRC, 0x1234, 0, true, &first);
        let f2 = frag(SRC, 0x1234, 10, false, &second);
        assert_eq!(r.process(&f1, now).unwrap(), Reassembly::Incomplete);
        assert_eq!(r.active_flows(), 1);
        match r.process(&f2, now).unwrap() {
            Reassembly::Reassembled(out) => {
                assert_eq!(out.len(), 160);
                let expected: Vec<u8> = (0x00..0xA0).collect();
                assert_eq!(out, expected);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(r.active_flows(), 0);
    }

    #[test]
    fn overlap_preserves_earlier_bytes() {
        let r = reassembler();
        let now = Instant::now();
        let f1 = frag(SRC, 1, 0, true, &[0xAA; 80]);
        let f2 = frag(SRC, 1, 5, false, &[0xBB; 80]);
        assert_eq!(r.process(&f1, now).unwrap(), Reassembly::Incomplete);
        match r.process(&f2, now).unwrap() {
            Reassembly::Reassembled(out) => {
                assert_eq!(out.len(), 120);
                assert_eq!(&out[..80], &[0xAA; 80]);
                assert_eq!(&out[80..], &[0xBB; 40]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_never_overwrites() {
        let r = reassembler();
        let now = Instant::now();
        let f1 = frag(SRC, 2, 0, true, &[0xAA; 80]);
        let dup = frag(SRC, 2, 0, true, &[0x11; 80]);
        let f2 = frag(SRC, 2, 10, false, &[0xCC; 80]);
        assert_eq!(r.process(&f1, now).unwrap(), Reassembly::Incomplete);
        assert_eq!(r.process(&dup, now).unwrap(), Reassembly::Incomplete);
        match r.process(&f2, now).unwrap() {
            Reassembly::Reassembled(out) => {
                assert_eq!(out.len(), 160);
                assert_eq!(&out[..80], &[0xAA; 80]);
                assert_eq!(&out[80..], &[0xCC; 80]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn flows_are_keyed_by_identification() {
        let r = reassembler();
        let now = Instant::now();
        let f1 = frag(SRC, 1, 0, true, &[1; 8]);
        let f2 = frag(SRC, 2, 0, true, &[2; 8]);
        assert_eq!(r.process(&f1, now).unwrap(), Reassembly::Incomplete);
        assert_eq!(r.process(&f2, now).unwrap(), Reassembly::Incomplete);
        assert_eq!(r.active_flows(), 2);
    }

    #[test]
    fn offset_beyond_limit_is_rejected() {
        let r = reassembler();
        let f = frag(SRC, 3, 8184, false, &[0; 8]);
        assert_eq!(
            r.process(&f, Instant::now()).unwrap_err(),
            ReassemblyError::OffsetTooLarge(8184)
        );
    }

    #[test]
    fn overflow_past_datagram_limit_is_rejected() {
        let r = reassembler();
        // 8183 * 8 + 80 = 65544 > 65535.
        let f = frag(SRC, 3, 8183, false, &[0; 80]);
        assert_eq!(
            r.process(&f, Instant::now()).unwrap_err(),
            ReassemblyError::DatagramTooLong(65544)
        );
    }

    #[test]
    fn empty_fragment_is_rejected() {
        let r = reassembler();
        let f = frag(SRC, 4, 1, true, &[]);
        assert_eq!(
            r.process(&f, Instant::now()).unwrap_err(),
            ReassemblyError::EmptyPayload
        );
    }

    #[test]
    fn truncated_header_is_rejected() {
        let r = reassembler();
        let err = r.process(&[0x45, 0x00, 0x00], Instant::now()).unwrap_err();
        assert!(matches!(err, ReassemblyError::BadHeader(_)));
    }

    #[test]
    fn configured_size_cap_applies() {
        let r = Reassembler::new(ReassemblyConfig {
            max_reassembled_size: 100,
            ..ReassemblyConfig::default()
        });
        let f = frag(SRC, 5, 5, false, &[0; 80]); // ends at 120
        assert_eq!(
            r.process(&f, Instant::now()).unwrap_err(),
            ReassemblyError::Oversize { size: 120, max: 100 }
        );
    }

    #[test]
    fn over_limit_flow_is_evicted_entirely() {
        let r = Reassembler::new(ReassemblyConfig {
            max_fragments_per_flow: 3,
            ..ReassemblyConfig::default()
        });
        let now = Instant::now();
        for i in 0..3u16 {
            let f = frag(SRC, 6, i * 2, true, &[i as u8; 8]);
            assert_eq!(r.process(&f, now).unwrap(), Reassembly::Incomplete);
        }
        let f = frag(SRC, 6, 100, true, &[9; 8]);
        assert_eq!(r.process(&f, now).unwrap_err(), ReassemblyError::Limit(3));
        assert_eq!(r.active_flows(), 0);
        // A later fragment for the same key starts a fresh flow.
        let f = frag(SRC, 6, 0, true, &[1; 8]);
        assert_eq!(r.process(&f, now).unwrap(), Reassembly::Incomplete);
        assert_eq!(r.active_flows(), 1);
    }

    #[test]
    fn rate_limited_source_is_refused() {
        let r = Reassembler::new(ReassemblyConfig {
            max_frags_per_ip: 2,
            ..ReassemblyConfig::default()
        });
        let now = Instant::now();
        let src = Ipv4Addr::from(SRC);
        for i in 0..2u16 {
            let f = frag(SRC, 7, i * 2, true, &[0; 8]);
            assert!(r.process(&f, now).is_ok());
        }
        let f = frag(SRC, 7, 100, true, &[0; 8]);
        assert_eq!(
            r.process(&f, now).unwrap_err(),
            ReassemblyError::RateLimitExceeded(src)
        );
        assert_eq!(r.rate_limited(), 1);
    }

    #[test]
    fn sweep_evicts_idle_flows() {
        let r = reassembler();
        let start = Instant::now();
        let f = frag(SRC, 8, 0, true, &[0; 8]);
        assert_eq!(r.process(&f, start).unwrap(), Reassembly::Incomplete);
        assert_eq!(r.sweep(start + Duration::from_secs(30)), 0);
        assert_eq!(r.active_flows(), 1);
        assert_eq!(r.sweep(start + Duration::from_secs(61)), 1);
        assert_eq!(r.active_flows(), 0);
    }

    #[test]
    fn declared_total_length_is_clamped() {
        let r = reassembler();
        // Header declares 200 total bytes, buffer carries 8 of payload.
        let mut f = frag(SRC, 9, 0, true, &[5; 8]);
        f[2..4].copy_from_slice(&200u16.to_be_bytes());
        assert_eq!(r.process(&f, Instant::now()).unwrap(), Reassembly::Incomplete);
    }
}
