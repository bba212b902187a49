// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

#![deny(unsafe_code, clippy::all, clippy::pedantic)]

//! Flow identification and the task-scoped flow registry.
//!
//! The registry is the correlation point between protocol parsers of one
//! task: a signalling parser publishes the media flows it expects, and the
//! media parser recognises them in O(1). It lives exactly as long as its
//! task.

mod key;
mod registry;

pub use key::FlowKey;
pub use registry::{FlowRegistry, SessionState};
