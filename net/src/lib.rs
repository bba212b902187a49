// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Frame model and strict L2-L4 decoding for the capture engine.
//!
//! The decoder takes a raw byte slice and produces a [`DecodedPacket`] whose
//! payload is a borrowed view into the input. For any input it either returns
//! a packet or a typed [`DecodeError`]; it never panics.

mod decode;
mod frame;
mod tunnel;

pub use decode::{
    DecodeError, DecodeOptions, DecodedPacket, EthMeta, FragmentMeta, IpMeta, TcpMeta,
    TransportMeta, decode, decode_transport,
};
pub use frame::RawFrame;
pub use tunnel::Tunnel;

/// EtherType for IPv4.
pub const ETH_P_IPV4: u16 = 0x0800;
/// EtherType for IPv6.
pub const ETH_P_IPV6: u16 = 0x86DD;
/// EtherType for 802.1Q VLAN tags.
pub const ETH_P_VLAN: u16 = 0x8100;
/// EtherType for 802.1ad provider bridging (QinQ outer tag).
pub const ETH_P_QINQ: u16 = 0x88A8;
