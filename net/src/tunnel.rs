// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Tunnel decapsulation: IPIP, GRE, VXLAN, and Geneve.
//!
//! Decap rewrites the effective transport protocol and records the inner
//! addresses on the outer [`IpMeta`]; decoding then continues on the inner
//! packet. An encapsulation that is enabled but not well-formed enough to
//! commit to (VXLAN without the VNI-valid flag, Geneve with a non-zero
//! version) falls back to plain transport decoding.

use crate::decode::{self, DecodeError, DecodeOptions, IpMeta, TransportMeta};
use etherparse::Ethernet2Header;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{ETH_P_IPV4, ETH_P_IPV6};

/// UDP destination port for VXLAN.
pub(crate) const VXLAN_PORT: u16 = 4789;
/// UDP destination port for Geneve.
pub(crate) const GENEVE_PORT: u16 = 6081;

const VXLAN_HEADER_LEN: usize = 8;
const VXLAN_FLAG_VNI_VALID: u8 = 0x08;
const GENEVE_BASE_LEN: usize = 8;

const GRE_FLAG_CHECKSUM: u8 = 0x80;
const GRE_FLAG_KEY: u8 = 0x20;
const GRE_FLAG_SEQUENCE: u8 = 0x10;

/// Tunnel encapsulations the decoder can peel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tunnel {
    Ipip,
    Gre,
    Vxlan,
    Geneve,
}

type Decapped<'a> = (Option<TransportMeta>, &'a [u8]);

/// IPIP: the payload is itself an IP datagram.
pub(crate) fn decap_ipip<'a>(
    ip: &mut IpMeta,
    buf: &'a [u8],
    opts: &DecodeOptions,
    depth: u8,
) -> Result<Decapped<'a>, DecodeError> {
    descend(ip, buf, opts, depth)
}

/// GRE (RFC 2784/2890): 4-byte base header plus 4 bytes for each of the
/// checksum, key, and sequence fields indicated by the flag bits.
pub(crate) fn decap_gre<'a>(
    ip: &mut IpMeta,
    buf: &'a [u8],
    opts: &DecodeOptions,
    depth: u8,
) -> Result<Decapped<'a>, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::PacketTooShort {
            layer: "gre",
            expected: 4,
            actual: buf.len(),
        });
    }
    let flags = buf[0];
    let proto_type = u16::from_be_bytes([buf[2], buf[3]]);
    let mut offset = 4;
    if flags & GRE_FLAG_CHECKSUM != 0 {
        offset += 4;
    }
    if flags & GRE_FLAG_KEY != 0 {
        offset += 4;
    }
    if flags & GRE_FLAG_SEQUENCE != 0 {
        offset += 4;
    }
    if buf.len() < offset {
        return Err(DecodeError::PacketTooShort {
            layer: "gre",
            expected: offset,
            actual: buf.len(),
        });
    }
    let inner = &buf[offset..];
    match proto_type {
        ETH_P_IPV4 | ETH_P_IPV6 => descend(ip, inner, opts, depth),
        other => {
            trace!("gre payload type {other:#06x} left undecoded");
            Ok((None, inner))
        }
    }
}

/// VXLAN (RFC 7348). Returns `None` when the VNI-valid flag is unset or the
/// buffer cannot hold the VXLAN header; the caller then treats the packet as
/// plain UDP.
pub(crate) fn decap_vxlan<'a>(
    ip: &mut IpMeta,
    buf: &'a [u8],
    opts: &DecodeOptions,
    depth: u8,
) -> Result<Option<Decapped<'a>>, DecodeError> {
    if buf.len() < VXLAN_HEADER_LEN || buf[0] & VXLAN_FLAG_VNI_VALID == 0 {
        return Ok(None);
    }
    inner_ethernet(ip, &buf[VXLAN_HEADER_LEN..], opts, depth).map(Some)
}

/// Geneve (RFC 8926): fixed 8 bytes plus `opt_len * 4` option bytes. Returns
/// `None` for versions other than 0.
pub(crate) fn decap_geneve<'a>(
    ip: &mut IpMeta,
    buf: &'a [u8],
    opts: &DecodeOptions,
    depth: u8,
) -> Result<Option<Decapped<'a>>, DecodeError> {
    if buf.len() < GENEVE_BASE_LEN || buf[0] >> 6 != 0 {
        return Ok(None);
    }
    let skip = GENEVE_BASE_LEN + usize::from(buf[0] & 0x3F) * 4;
    if buf.len() < skip {
        return Err(DecodeError::PacketTooShort {
            layer: "geneve",
            expected: skip,
            actual: buf.len(),
        });
    }
    inner_ethernet(ip, &buf[skip..], opts, depth).map(Some)
}

/// Skip the encapsulated 14-byte Ethernet header and decode the inner IP
/// datagram. Ethernet-carrying tunnels do not nest VLAN tags.
fn inner_ethernet<'a>(
    ip: &mut IpMeta,
    buf: &'a [u8],
    opts: &DecodeOptions,
    depth: u8,
) -> Result<Decapped<'a>, DecodeError> {
    if buf.len() < Ethernet2Header::LEN {
        return Err(DecodeError::PacketTooShort {
            layer: "inner ethernet",
            expected: Ethernet2Header::LEN,
            actual: buf.len(),
        });
    }
    descend(ip, &buf[Ethernet2Header::LEN..], opts, depth)
}

/// Decode the inner IP datagram, record its addresses on the outer header,
/// and continue with the inner protocol.
fn descend<'a>(
    ip: &mut IpMeta,
    buf: &'a [u8],
    opts: &DecodeOptions,
    depth: u8,
) -> Result<Decapped<'a>, DecodeError> {
    let (inner, inner_payload) = decode::decode_ip(buf)?;
    ip.inner_src = Some(inner.src);
    ip.inner_dst = Some(inner.dst);
    ip.protocol = inner.protocol;
    if inner.fragment.is_some() {
        // Inner fragments are not reassembled; hand the raw fragment on.
        return Ok((None, inner_payload));
    }
    decode::decode_l4(ip, inner.protocol, inner_payload, opts, depth + 1)
}
