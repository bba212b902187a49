// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! L2-L4 frame decoding.

use crate::tunnel::{self, Tunnel};
use crate::{ETH_P_IPV4, ETH_P_IPV6, ETH_P_QINQ, ETH_P_VLAN};
use arrayvec::ArrayVec;
use etherparse::err::{ipv4, ipv6, tcp};
use etherparse::{Ethernet2Header, Ipv4Header, Ipv6Header, SingleVlanHeader, TcpHeader, UdpHeader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

/// IP protocol number for IP-in-IP encapsulation.
pub const IP_PROTO_IPIP: u8 = 4;
/// IP protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const IP_PROTO_UDP: u8 = 17;
/// IP protocol number for GRE.
pub const IP_PROTO_GRE: u8 = 47;

// Nested encapsulation is bounded; anything deeper is left undecoded.
pub(crate) const MAX_TUNNEL_DEPTH: u8 = 2;

/// Why the decoder refused a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A layer declared more bytes than the buffer holds.
    #[error("{layer} header needs {expected} bytes, buffer has {actual}")]
    PacketTooShort {
        layer: &'static str,
        expected: usize,
        actual: usize,
    },
    /// IP version nibble other than 4 or 6.
    #[error("unsupported ip version {0}")]
    UnsupportedProtocol(u8),
}

/// Per-task decoding options.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Tunnel encapsulations the decoder should peel.
    pub tunnels: Vec<Tunnel>,
}

impl DecodeOptions {
    #[must_use]
    pub fn with_tunnels(tunnels: Vec<Tunnel>) -> Self {
        Self { tunnels }
    }

    pub(crate) fn tunnel_enabled(&self, tunnel: Tunnel) -> bool {
        self.tunnels.contains(&tunnel)
    }
}

/// Link-layer fields of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthMeta {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    /// Terminal EtherType after any VLAN tags.
    pub ether_type: u16,
    /// VLAN IDs in outer-to-inner order.
    pub vlan_ids: ArrayVec<u16, 2>,
}

/// IPv4 fragmentation fields, present iff the datagram is a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentMeta {
    pub more_fragments: bool,
    /// Fragment offset in 8-byte units.
    pub offset_units: u16,
    pub identification: u16,
}

/// Network-layer fields of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpMeta {
    pub version: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol; rewritten to the inner protocol when a tunnel is
    /// peeled.
    pub protocol: u8,
    pub ttl: u8,
    pub total_len: u16,
    /// Innermost tunnelled source, when tunnel decap succeeded.
    pub inner_src: Option<IpAddr>,
    /// Innermost tunnelled destination, when tunnel decap succeeded.
    pub inner_dst: Option<IpAddr>,
    pub fragment: Option<FragmentMeta>,
}

/// TCP-only transport fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpMeta {
    pub seq: u32,
    pub ack: u32,
    /// Lower six TCP flag bits (FIN..URG).
    pub flags: u8,
}

/// Transport-layer fields of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMeta {
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp: Option<TcpMeta>,
}

/// A decoded frame. The payload borrows from the decoder's input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket<'a> {
    pub timestamp: SystemTime,
    pub eth: EthMeta,
    pub ip: Option<IpMeta>,
    pub transport: Option<TransportMeta>,
    /// Residual application payload.
    pub payload: &'a [u8],
    /// Byte offset of the (outer) IP header within the input buffer, when
    /// there is an IP layer. Lets callers recover the raw datagram bytes for
    /// reassembly.
    pub l3_offset: Option<usize>,
    /// True when the payload came out of the IPv4 reassembler.
    pub reassembled: bool,
}

impl DecodedPacket<'_> {
    /// True iff the decoded IP layer is an IPv4 fragment.
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.ip.as_ref().is_some_and(|ip| ip.fragment.is_some())
    }
}

/// Decode a raw frame starting at the Ethernet header.
///
/// # Errors
///
/// Returns [`DecodeError::PacketTooShort`] when any layer declares more bytes
/// than the buffer holds and [`DecodeError::UnsupportedProtocol`] for IP
/// versions other than 4 and 6. EtherTypes without an L3 decoder are accepted
/// and returned with `ip: None`.
pub fn decode<'a>(
    buf: &'a [u8],
    timestamp: SystemTime,
    opts: &DecodeOptions,
) -> Result<DecodedPacket<'a>, DecodeError> {
    let (eth, l3) = decode_ethernet(buf)?;
    let l3_offset = buf.len() - l3.len();
    if eth.ether_type == ETH_P_IPV4 || eth.ether_type == ETH_P_IPV6 {
        let (mut ip, ip_payload) = decode_ip(l3)?;
        if ip.fragment.is_some() {
            // The transport header may be split across fragments; leave the
            // fragment payload for the reassembler.
            return Ok(DecodedPacket {
                timestamp,
                eth,
                ip: Some(ip),
                transport: None,
                payload: ip_payload,
                l3_offset: Some(l3_offset),
                reassembled: false,
            });
        }
        let protocol = ip.protocol;
        let (transport, payload) = decode_l4(&mut ip, protocol, ip_payload, opts, 0)?;
        Ok(DecodedPacket {
            timestamp,
            eth,
            ip: Some(ip),
            transport,
            payload,
            l3_offset: Some(l3_offset),
            reassembled: false,
        })
    } else {
        Ok(DecodedPacket {
            timestamp,
            eth,
            ip: None,
            transport: None,
            payload: l3,
            l3_offset: None,
            reassembled: false,
        })
    }
}

/// Decode the transport layer of an already-located IP payload.
///
/// Used by pipelines to resume decoding after fragment reassembly; `ip` is
/// updated in place when tunnel decap rewrites the effective protocol.
///
/// # Errors
///
/// Same failure modes as [`decode`].
pub fn decode_transport<'a>(
    ip: &mut IpMeta,
    protocol: u8,
    buf: &'a [u8],
    opts: &DecodeOptions,
) -> Result<(Option<TransportMeta>, &'a [u8]), DecodeError> {
    decode_l4(ip, protocol, buf, opts, 0)
}

fn decode_ethernet(buf: &[u8]) -> Result<(EthMeta, &[u8]), DecodeError> {
    let (hdr, mut rest) =
        Ethernet2Header::from_slice(buf).map_err(|e| DecodeError::PacketTooShort {
            layer: "ethernet",
            expected: e.required_len,
            actual: buf.len(),
        })?;
    let mut ether_type = hdr.ether_type.0;
    let mut vlan_ids = ArrayVec::new();
    while ether_type == ETH_P_VLAN || ether_type == ETH_P_QINQ {
        let len = rest.len();
        let (vlan, after) =
            SingleVlanHeader::from_slice(rest).map_err(|e| DecodeError::PacketTooShort {
                layer: "vlan",
                expected: e.required_len,
                actual: len,
            })?;
        // Record the low 12 TCI bits of each tag, outer first.
        if !vlan_ids.is_full() {
            vlan_ids.push(vlan.vlan_id.value());
        }
        ether_type = vlan.ether_type.0;
        rest = after;
    }
    Ok((
        EthMeta {
            src_mac: hdr.source,
            dst_mac: hdr.destination,
            ether_type,
            vlan_ids,
        },
        rest,
    ))
}

pub(crate) fn decode_ip(buf: &[u8]) -> Result<(IpMeta, &[u8]), DecodeError> {
    let version = buf.first().map(|b| b >> 4).ok_or(DecodeError::PacketTooShort {
        layer: "ip",
        expected: 1,
        actual: 0,
    })?;
    match version {
        4 => decode_ipv4(buf),
        6 => decode_ipv6(buf),
        other => Err(DecodeError::UnsupportedProtocol(other)),
    }
}

fn decode_ipv4(buf: &[u8]) -> Result<(IpMeta, &[u8]), DecodeError> {
    let (hdr, _) = Ipv4Header::from_slice(buf).map_err(|e| match e {
        ipv4::HeaderSliceError::Len(l) => DecodeError::PacketTooShort {
            layer: "ipv4",
            expected: l.required_len,
            actual: buf.len(),
        },
        ipv4::HeaderSliceError::Content(content) => match content {
            ipv4::HeaderError::UnexpectedVersion { version_number } => {
                DecodeError::UnsupportedProtocol(version_number)
            }
            // IHL*4 < 20: the header cannot even hold itself.
            _ => DecodeError::PacketTooShort {
                layer: "ipv4",
                expected: 20,
                actual: buf.len(),
            },
        },
    })?;
    let header_len = hdr.header_len();
    // Payload spans [IHL*4, total_length), clamped to the buffer.
    let end = usize::from(hdr.total_len).clamp(header_len, buf.len());
    let payload = &buf[header_len..end];
    let fragment = if hdr.more_fragments || hdr.fragment_offset.value() != 0 {
        Some(FragmentMeta {
            more_fragments: hdr.more_fragments,
            offset_units: hdr.fragment_offset.value(),
            identification: hdr.identification,
        })
    } else {
        None
    };
    Ok((
        IpMeta {
            version: 4,
            src: IpAddr::V4(Ipv4Addr::from(hdr.source)),
            dst: IpAddr::V4(Ipv4Addr::from(hdr.destination)),
            protocol: hdr.protocol.0,
            ttl: hdr.time_to_live,
            total_len: hdr.total_len,
            inner_src: None,
            inner_dst: None,
            fragment,
        },
        payload,
    ))
}

fn decode_ipv6(buf: &[u8]) -> Result<(IpMeta, &[u8]), DecodeError> {
    let (hdr, _) = Ipv6Header::from_slice(buf).map_err(|e| match e {
        ipv6::HeaderSliceError::Len(l) => DecodeError::PacketTooShort {
            layer: "ipv6",
            expected: l.required_len,
            actual: buf.len(),
        },
        ipv6::HeaderSliceError::Content(ipv6::HeaderError::UnexpectedVersion {
            version_number,
        }) => DecodeError::UnsupportedProtocol(version_number),
        #[allow(unreachable_patterns)]
        ipv6::HeaderSliceError::Content(_) => DecodeError::PacketTooShort {
            layer: "ipv6",
            expected: Ipv6Header::LEN,
            actual: buf.len(),
        },
    })?;
    let end = (Ipv6Header::LEN + usize::from(hdr.payload_length)).min(buf.len());
    let payload = &buf[Ipv6Header::LEN..end];
    Ok((
        IpMeta {
            version: 6,
            src: IpAddr::V6(Ipv6Addr::from(hdr.source)),
            dst: IpAddr::V6(Ipv6Addr::from(hdr.destination)),
            // Extension headers are not traversed; next-header stands in for
            // the transport protocol.
            protocol: hdr.next_header.0,
            ttl: hdr.hop_limit,
            total_len: 40u16.saturating_add(hdr.payload_length),
            inner_src: None,
            inner_dst: None,
            fragment: None,
        },
        payload,
    ))
}

pub(crate) fn decode_l4<'a>(
    ip: &mut IpMeta,
    protocol: u8,
    buf: &'a [u8],
    opts: &DecodeOptions,
    depth: u8,
) -> Result<(Option<TransportMeta>, &'a [u8]), DecodeError> {
    match protocol {
        IP_PROTO_TCP => {
            let (tcp, rest) = TcpHeader::from_slice(buf).map_err(|e| match e {
                tcp::HeaderSliceError::Len(l) => DecodeError::PacketTooShort {
                    layer: "tcp",
                    expected: l.required_len,
                    actual: buf.len(),
                },
                tcp::HeaderSliceError::Content(_) => DecodeError::PacketTooShort {
                    layer: "tcp",
                    expected: 20,
                    actual: buf.len(),
                },
            })?;
            let flags = u8::from(tcp.fin)
                | (u8::from(tcp.syn) << 1)
                | (u8::from(tcp.rst) << 2)
                | (u8::from(tcp.psh) << 3)
                | (u8::from(tcp.ack) << 4)
                | (u8::from(tcp.urg) << 5);
            Ok((
                Some(TransportMeta {
                    protocol,
                    src_port: tcp.source_port,
                    dst_port: tcp.destination_port,
                    tcp: Some(TcpMeta {
                        seq: tcp.sequence_number,
                        ack: tcp.acknowledgment_number,
                        flags,
                    }),
                }),
                rest,
            ))
        }
        IP_PROTO_UDP => {
            let (udp, rest) =
                UdpHeader::from_slice(buf).map_err(|e| DecodeError::PacketTooShort {
                    layer: "udp",
                    expected: e.required_len,
                    actual: buf.len(),
                })?;
            if depth < MAX_TUNNEL_DEPTH {
                if udp.destination_port == tunnel::VXLAN_PORT
                    && opts.tunnel_enabled(Tunnel::Vxlan)
                {
                    if let Some(decapped) = tunnel::decap_vxlan(ip, rest, opts, depth)? {
                        return Ok(decapped);
                    }
                }
                if udp.destination_port == tunnel::GENEVE_PORT
                    && opts.tunnel_enabled(Tunnel::Geneve)
                {
                    if let Some(decapped) = tunnel::decap_geneve(ip, rest, opts, depth)? {
                        return Ok(decapped);
                    }
                }
            }
            Ok((
                Some(TransportMeta {
                    protocol,
                    src_port: udp.source_port,
                    dst_port: udp.destination_port,
                    tcp: None,
                }),
                rest,
            ))
        }
        IP_PROTO_IPIP if depth < MAX_TUNNEL_DEPTH && opts.tunnel_enabled(Tunnel::Ipip) => {
            tunnel::decap_ipip(ip, buf, opts, depth)
        }
        IP_PROTO_GRE if depth < MAX_TUNNEL_DEPTH && opts.tunnel_enabled(Tunnel::Gre) => {
            tunnel::decap_gre(ip, buf, opts, depth)
        }
        _ => Ok((None, buf)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) const TS: SystemTime = SystemTime::UNIX_EPOCH;

    pub(crate) fn eth_header(ether_type: u16) -> Vec<u8> {
        let mut buf = vec![
            0x02, 0x00, 0x00, 0x00, 0x00, 0x01, // dst
            0x02, 0x00, 0x00, 0x00, 0x00, 0x02, // src
        ];
        buf.extend_from_slice(&ether_type.to_be_bytes());
        buf
    }

    pub(crate) fn ipv4_header(
        src: [u8; 4],
        dst: [u8; 4],
        protocol: u8,
        payload_len: u16,
        frag_word: u16,
    ) -> Vec<u8> {
        let total = 20 + payload_len;
        let mut buf = vec![0x45, 0x00];
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(&0x1234u16.to_be_bytes()); // identification
        buf.extend_from_slice(&frag_word.to_be_bytes());
        buf.push(64); // ttl
        buf.push(protocol);
        buf.extend_from_slice(&[0, 0]); // checksum (unchecked)
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&dst);
        buf
    }

    pub(crate) fn udp_header(src_port: u16, dst_port: u16, payload_len: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&src_port.to_be_bytes());
        buf.extend_from_slice(&dst_port.to_be_bytes());
        buf.extend_from_slice(&(8 + payload_len).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    fn ipv4_udp_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = eth_header(ETH_P_IPV4);
        #[allow(clippy::cast_possible_truncation)]
        let payload_len = payload.len() as u16;
        frame.extend(ipv4_header(
            [192, 168, 1, 1],
            [10, 0, 0, 1],
            IP_PROTO_UDP,
            8 + payload_len,
            0,
        ));
        frame.extend(udp_header(5060, 5060, payload_len));
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn decodes_plain_ipv4_udp() {
        let frame = ipv4_udp_frame(b"hello");
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        assert_eq!(pkt.eth.ether_type, ETH_P_IPV4);
        assert!(pkt.eth.vlan_ids.is_empty());
        assert!(!pkt.is_fragment());
        let ip = pkt.ip.unwrap();
        assert_eq!(ip.src, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(ip.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ip.protocol, IP_PROTO_UDP);
        assert_eq!(ip.ttl, 64);
        let transport = pkt.transport.unwrap();
        assert_eq!(transport.src_port, 5060);
        assert_eq!(transport.dst_port, 5060);
        assert_eq!(pkt.payload, b"hello");
        assert_eq!(pkt.l3_offset, Some(14));
    }

    #[test]
    fn walks_qinq_tags_outer_to_inner() {
        let mut frame = eth_header(ETH_P_QINQ);
        frame.extend_from_slice(&100u16.to_be_bytes()); // outer TCI, vid 100
        frame.extend_from_slice(&ETH_P_VLAN.to_be_bytes());
        frame.extend_from_slice(&200u16.to_be_bytes()); // inner TCI, vid 200
        frame.extend_from_slice(&ETH_P_IPV4.to_be_bytes());
        frame.extend(ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_UDP, 8, 0));
        frame.extend(udp_header(1000, 2000, 0));
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        assert_eq!(pkt.eth.vlan_ids.as_slice(), &[100, 200]);
        assert_eq!(pkt.eth.ether_type, ETH_P_IPV4);
        assert_eq!(pkt.l3_offset, Some(22));
        assert!(pkt.ip.is_some());
    }

    #[test]
    fn vlan_tci_keeps_low_twelve_bits() {
        let mut frame = eth_header(ETH_P_VLAN);
        // PCP 5, DEI set, vid 0x123.
        frame.extend_from_slice(&0xB123u16.to_be_bytes());
        frame.extend_from_slice(&ETH_P_IPV4.to_be_bytes());
        frame.extend(ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_UDP, 8, 0));
        frame.extend(udp_header(1, 2, 0));
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        assert_eq!(pkt.eth.vlan_ids.as_slice(), &[0x123]);
    }

    #[test]
    fn non_ip_ethertype_bypasses_l3() {
        let mut frame = eth_header(0x0806); // ARP
        frame.extend_from_slice(&[0xAA; 28]);
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        assert_eq!(pkt.eth.ether_type, 0x0806);
        assert!(pkt.ip.is_none());
        assert!(pkt.transport.is_none());
        assert_eq!(pkt.payload, &[0xAA; 28]);
    }

    #[test]
    fn short_ethernet_is_too_short() {
        let err = decode(&[0u8; 10], TS, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::PacketTooShort { layer: "ethernet", .. }));
    }

    #[test]
    fn ihl_below_minimum_is_rejected() {
        let mut frame = eth_header(ETH_P_IPV4);
        let mut ip = ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_UDP, 0, 0);
        ip[0] = 0x44; // version 4, IHL 4 (16 bytes < 20)
        frame.extend(ip);
        let err = decode(&frame, TS, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::PacketTooShort { layer: "ipv4", .. }));
    }

    #[test]
    fn ip_version_five_is_unsupported() {
        let mut frame = eth_header(ETH_P_IPV4);
        let mut ip = ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_UDP, 0, 0);
        ip[0] = 0x55;
        frame.extend(ip);
        let err = decode(&frame, TS, &DecodeOptions::default()).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedProtocol(5));
    }

    #[test]
    fn total_length_is_clamped_to_buffer() {
        let mut frame = eth_header(ETH_P_IPV4);
        // Declares 1000 bytes of payload but carries 4.
        frame.extend(ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], 0xFD, 1000, 0));
        frame.extend_from_slice(&[1, 2, 3, 4]);
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        assert_eq!(pkt.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn fragment_detection() {
        let mut first = eth_header(ETH_P_IPV4);
        first.extend(ipv4_header(
            [1, 1, 1, 1],
            [2, 2, 2, 2],
            IP_PROTO_UDP,
            16,
            0x2000, // MF=1, offset 0
        ));
        first.extend_from_slice(&[0u8; 16]);
        let pkt = decode(&first, TS, &DecodeOptions::default()).unwrap();
        let frag = pkt.ip.as_ref().unwrap().fragment.unwrap();
        assert!(frag.more_fragments);
        assert_eq!(frag.offset_units, 0);
        assert_eq!(frag.identification, 0x1234);
        assert!(pkt.transport.is_none());

        let mut middle = eth_header(ETH_P_IPV4);
        middle.extend(ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_UDP, 16, 10));
        middle.extend_from_slice(&[0u8; 16]);
        let pkt = decode(&middle, TS, &DecodeOptions::default()).unwrap();
        let frag = pkt.ip.as_ref().unwrap().fragment.unwrap();
        assert!(!frag.more_fragments);
        assert_eq!(frag.offset_units, 10);

        // Offset 0, MF=0: not a fragment.
        let whole = ipv4_udp_frame(b"x");
        let pkt = decode(&whole, TS, &DecodeOptions::default()).unwrap();
        assert!(!pkt.is_fragment());
    }

    #[test]
    fn tcp_fields_and_flags() {
        let mut frame = eth_header(ETH_P_IPV4);
        frame.extend(ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_TCP, 24, 0));
        let mut tcp = Vec::new();
        tcp.extend_from_slice(&8080u16.to_be_bytes());
        tcp.extend_from_slice(&443u16.to_be_bytes());
        tcp.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        tcp.extend_from_slice(&0x0102_0304u32.to_be_bytes());
        tcp.push(5 << 4); // data offset 5
        tcp.push(0b0001_0010); // SYN|ACK
        tcp.extend_from_slice(&[0xFF, 0xFF, 0, 0, 0, 0]); // window, checksum, urg
        frame.extend(tcp);
        frame.extend_from_slice(b"data");
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        let transport = pkt.transport.unwrap();
        assert_eq!(transport.src_port, 8080);
        assert_eq!(transport.dst_port, 443);
        let tcp = transport.tcp.unwrap();
        assert_eq!(tcp.seq, 0xDEAD_BEEF);
        assert_eq!(tcp.ack, 0x0102_0304);
        assert_eq!(tcp.flags, 0b01_0010);
        assert_eq!(pkt.payload, b"data");
    }

    #[test]
    fn tcp_data_offset_below_five_is_rejected() {
        let mut frame = eth_header(ETH_P_IPV4);
        frame.extend(ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], IP_PROTO_TCP, 20, 0));
        let mut tcp = vec![0u8; 20];
        tcp[12] = 4 << 4;
        frame.extend(tcp);
        let err = decode(&frame, TS, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::PacketTooShort { layer: "tcp", .. }));
    }

    #[test]
    fn decodes_ipv6_udp() {
        let mut frame = eth_header(ETH_P_IPV6);
        let mut ip = vec![0x60, 0, 0, 0];
        ip.extend_from_slice(&12u16.to_be_bytes()); // payload length: udp + 4
        ip.push(IP_PROTO_UDP);
        ip.push(63); // hop limit
        ip.extend_from_slice(&[0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        ip.extend_from_slice(&[0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        frame.extend(ip);
        frame.extend(udp_header(53, 5353, 4));
        frame.extend_from_slice(b"abcd");
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        let ip = pkt.ip.unwrap();
        assert_eq!(ip.version, 6);
        assert_eq!(ip.ttl, 63);
        assert_eq!(ip.total_len, 52);
        assert_eq!(pkt.transport.unwrap().dst_port, 5353);
        assert_eq!(pkt.payload, b"abcd");
    }

    #[test]
    fn other_protocols_pass_through() {
        let mut frame = eth_header(ETH_P_IPV4);
        frame.extend(ipv4_header([1, 1, 1, 1], [2, 2, 2, 2], 132, 6, 0)); // SCTP
        frame.extend_from_slice(&[9, 9, 9, 9, 9, 9]);
        let pkt = decode(&frame, TS, &DecodeOptions::default()).unwrap();
        assert_eq!(pkt.ip.unwrap().protocol, 132);
        assert!(pkt.transport.is_none());
        assert_eq!(pkt.payload, &[9, 9, 9, 9, 9, 9]);
    }

    #[test]
    fn decoder_never_panics() {
        let opts = DecodeOptions::with_tunnels(vec![
            Tunnel::Ipip,
            Tunnel::Gre,
            Tunnel::Vxlan,
            Tunnel::Geneve,
        ]);
        bolero::check!().with_type().for_each(|bytes: &Vec<u8>| {
            if let Ok(pkt) = decode(bytes, TS, &opts) {
                assert!(pkt.payload.len() <= bytes.len());
            }
        });
    }
}
