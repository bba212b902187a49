// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! AF_PACKET capture plugin.

use afpacket::sync::RawPacketStream;
use concurrency::CancelToken;
use crossbeam_channel::Sender;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use net::RawFrame;
use plugin::{
    CaptureCounters, CaptureStats, Capturer, ConfigMap, PausableCapture, Plugin, PluginError,
};
use std::collections::HashMap;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const MAX_FRAME: usize = 65535;
const POLL_TIMEOUT: Duration = Duration::from_millis(20);
const PAUSE_NAP: Duration = Duration::from_millis(50);

/// One bound packet socket.
struct Iface {
    ifindex: u32,
    name: String,
    sock: RawPacketStream,
    raw_fd: RawFd,
}

impl Iface {
    /// Open a non-blocking packet socket bound to `name`.
    fn open(ifindex: u32, name: &str) -> io::Result<Self> {
        let mut sock = RawPacketStream::new().map_err(|e| {
            error!("failed to open raw socket for '{name}': {e}");
            e
        })?;
        sock.set_non_blocking();
        sock.bind(name)
            .inspect_err(|e| error!("failed to bind raw socket to '{name}': {e}"))?;
        let raw_fd = sock.as_raw_fd();
        debug!("opened packet socket on '{name}'");
        Ok(Self {
            ifindex,
            name: name.to_owned(),
            sock,
            raw_fd,
        })
    }
}

/// The sockets and poller of one capture run.
struct IfaceTable {
    poll: Poll,
    by_token: HashMap<Token, Iface>,
    next_token: usize,
}

impl IfaceTable {
    fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            by_token: HashMap::new(),
            next_token: 1,
        })
    }

    fn add(&mut self, ifindex: u32, name: &str) -> io::Result<()> {
        let token = Token(self.next_token);
        let iface = Iface::open(ifindex, name)?;
        let mut source = SourceFd(&iface.raw_fd);
        self.poll
            .registry()
            .register(&mut source, token, Interest::READABLE)
            .inspect_err(|e| error!("failed to register '{name}': {e}"))?;
        self.by_token.insert(token, iface);
        self.next_token += 1;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

/// Captures frames from kernel packet sockets, one per configured interface.
///
/// Options: `interfaces` is a list of interface names; the single entry
/// `any` (case-insensitive) captures on every interface.
#[derive(Default)]
pub struct AfpacketCapturer {
    interfaces: Vec<String>,
    counters: CaptureCounters,
    paused: AtomicBool,
}

impl AfpacketCapturer {
    fn build_table(&self) -> io::Result<IfaceTable> {
        let known = netdev::get_interfaces();
        let mut table = IfaceTable::new()?;
        if self.interfaces.len() == 1 && self.interfaces[0].eq_ignore_ascii_case("any") {
            for iface in &known {
                if let Err(e) = table.add(iface.index, &iface.name) {
                    error!("skipping interface '{}': {e}", iface.name);
                }
            }
        } else {
            for name in &self.interfaces {
                match known.iter().find(|iface| &iface.name == name) {
                    Some(iface) => {
                        if let Err(e) = table.add(iface.index, name) {
                            error!("skipping interface '{name}': {e}");
                        }
                    }
                    None => warn!("no such interface '{name}'"),
                }
            }
        }
        Ok(table)
    }

    /// Drain one readable socket, pushing frames downstream. A full pipeline
    /// queue drops the frame; the bounded channel is the backpressure.
    fn drain_socket(&self, iface: &mut Iface, out: &Sender<RawFrame>) {
        let mut buf = [0u8; MAX_FRAME];
        loop {
            match iface.sock.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    self.counters.add_received(1);
                    let frame = RawFrame::new(buf[..len].to_vec(), iface.ifindex);
                    if out.try_send(frame).is_err() {
                        self.counters.add_dropped(1);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Loopback produces short reads routinely; don't spam.
                    if iface.name != "lo" {
                        error!("read error on '{}': {e}", iface.name);
                    }
                    break;
                }
            }
        }
    }
}

impl Plugin for AfpacketCapturer {
    fn name(&self) -> &'static str {
        "afpacket"
    }

    fn init(&mut self, cfg: &ConfigMap) -> Result<(), PluginError> {
        self.interfaces = match cfg.get("interfaces") {
            Some(serde_json::Value::Array(names)) => names
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_owned)
                .collect(),
            Some(serde_json::Value::String(name)) => vec![name.clone()],
            Some(other) => {
                return Err(PluginError::InitFailed {
                    name: "afpacket".to_owned(),
                    reason: format!("'interfaces' must be a list of names, got {other}"),
                });
            }
            None => vec!["any".to_owned()],
        };
        Ok(())
    }
}

impl Capturer for AfpacketCapturer {
    fn capture(&self, cancel: &CancelToken, out: &Sender<RawFrame>) -> Result<(), PluginError> {
        let mut table = self.build_table()?;
        if table.is_empty() {
            warn!("no capturable interfaces; no packets will be processed");
            cancel.wait();
            return Ok(());
        }
        let mut events = Events::with_capacity(256);
        while !cancel.is_cancelled() {
            if self.paused.load(Ordering::Relaxed) {
                if cancel.wait_timeout(PAUSE_NAP) {
                    break;
                }
                continue;
            }
            if let Err(e) = table.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(PluginError::Io(e));
            }
            for event in &events {
                if !event.is_readable() {
                    continue;
                }
                let token = event.token();
                if let Some(iface) = table.by_token.get_mut(&token) {
                    self.drain_socket(iface, out);
                }
            }
        }
        Ok(())
    }

    fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    fn as_pausable(&self) -> Option<&dyn PausableCapture> {
        Some(self)
    }
}

impl PausableCapture for AfpacketCapturer {
    fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_accepts_interface_lists() {
        let mut capturer = AfpacketCapturer::default();
        let cfg: ConfigMap =
            serde_json::from_value(serde_json::json!({"interfaces": ["eth0", "eth1"]})).unwrap();
        capturer.init(&cfg).unwrap();
        assert_eq!(capturer.interfaces, vec!["eth0", "eth1"]);
    }

    #[test]
    fn init_defaults_to_any() {
        let mut capturer = AfpacketCapturer::default();
        capturer.init(&ConfigMap::new()).unwrap();
        assert_eq!(capturer.interfaces, vec!["any"]);
    }

    #[test]
    fn init_rejects_non_list() {
        let mut capturer = AfpacketCapturer::default();
        let cfg: ConfigMap = serde_json::from_value(serde_json::json!({"interfaces": 7})).unwrap();
        assert!(matches!(
            capturer.init(&cfg).unwrap_err(),
            PluginError::InitFailed { .. }
        ));
    }

    #[test]
    fn pause_flag_round_trips() {
        let capturer = AfpacketCapturer::default();
        let pausable = capturer.as_pausable().unwrap();
        pausable.pause();
        assert!(capturer.paused.load(Ordering::Relaxed));
        pausable.resume();
        assert!(!capturer.paused.load(Ordering::Relaxed));
    }
}
