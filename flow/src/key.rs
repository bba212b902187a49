// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

use net::DecodedPacket;
use std::fmt;
use std::net::IpAddr;

/// A directional 5-tuple identifying half of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    #[must_use]
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16, protocol: u8) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// Key for the opposite direction of the same session.
    #[must_use]
    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Extract the 5-tuple of a decoded packet, if it has one.
    #[must_use]
    pub fn from_decoded(pkt: &DecodedPacket) -> Option<Self> {
        let ip = pkt.ip.as_ref()?;
        let transport = pkt.transport.as_ref()?;
        Some(Self {
            src_ip: ip.src,
            dst_ip: ip.dst,
            src_port: transport.src_port,
            dst_port: transport.dst_port,
            protocol: transport.protocol,
        })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            5060,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5080,
            17,
        )
    }

    #[test]
    fn reverse_is_involutive() {
        let k = key();
        assert_ne!(k, k.reverse());
        assert_eq!(k, k.reverse().reverse());
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(key().to_string(), "192.168.1.1:5060->10.0.0.1:5080/17");
    }
}
