// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Raw captured frames.

use std::time::SystemTime;

/// A frame as delivered by a capture driver.
///
/// The bytes are owned: capture rings reuse their buffers, so drivers copy
/// each frame out of the ring before handing it to a pipeline.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame bytes, starting at the Ethernet header.
    pub data: Vec<u8>,
    /// Capture timestamp.
    pub timestamp: SystemTime,
    /// Bytes actually captured (equals `data.len()`).
    pub captured_len: u32,
    /// Length of the frame on the wire, which may exceed `captured_len`
    /// when the driver truncates.
    pub original_len: u32,
    /// Interface the frame arrived on.
    pub ifindex: u32,
}

impl RawFrame {
    /// Build a frame captured in full right now.
    #[must_use]
    pub fn new(data: Vec<u8>, ifindex: u32) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let len = data.len() as u32;
        Self {
            data,
            timestamp: SystemTime::now(),
            captured_len: len,
            original_len: len,
            ifindex,
        }
    }

    /// Build a truncated frame: `data` holds the captured prefix of a frame
    /// that was `original_len` bytes on the wire.
    #[must_use]
    pub fn truncated(data: Vec<u8>, original_len: u32, ifindex: u32) -> Self {
        let mut frame = Self::new(data, ifindex);
        frame.original_len = original_len;
        frame
    }
}
