// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! IPv4 fragment reassembly with the BSD-Right overlap policy.
//!
//! Fragments are buffered per (src, dst, protocol, id) flow. On overlap the
//! earlier-arrived bytes always win: the newcomer is trimmed to whatever gap
//! it still fills, which defeats tiny-overlap evasion. Memory is bounded by a
//! per-flow fragment cap, a per-source rate limiter, a datagram size cap, and
//! a background timeout sweeper.

mod frag;
mod limiter;
mod reassembler;

pub use frag::{FragmentKey, HARD_FRAGMENT_CAP, MAX_DATAGRAM_SIZE, MAX_FRAG_OFFSET_UNITS};
pub use limiter::FragmentRateLimiter;
pub use reassembler::{Reassembler, Reassembly, ReassemblyConfig, ReassemblyError};
