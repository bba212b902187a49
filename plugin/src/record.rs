// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

use crate::labels::Labels;
use chrono::{DateTime, Utc};
use net::DecodedPacket;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::SystemTime;

/// Where and when a record was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub task_id: String,
    pub agent_id: String,
    pub pipeline_id: usize,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    #[must_use]
    pub fn new(task_id: &str, agent_id: &str, pipeline_id: usize, captured_at: SystemTime) -> Self {
        Self {
            task_id: task_id.to_owned(),
            agent_id: agent_id.to_owned(),
            pipeline_id,
            timestamp: DateTime::<Utc>::from(captured_at),
        }
    }
}

/// The 5-tuple of an output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FiveTuple {
    /// Extract the 5-tuple of a decoded packet. Packets without a transport
    /// layer get zero ports; packets without an IP layer have no tuple.
    #[must_use]
    pub fn from_decoded(pkt: &DecodedPacket) -> Option<Self> {
        let ip = pkt.ip.as_ref()?;
        let (src_port, dst_port, protocol) = match pkt.transport.as_ref() {
            Some(t) => (t.src_port, t.dst_port, t.protocol),
            None => (0, 0, ip.protocol),
        };
        Some(Self {
            src_ip: ip.src,
            dst_ip: ip.dst,
            src_port,
            dst_port,
            protocol,
        })
    }
}

/// An annotated record on its way to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPacket {
    pub envelope: Envelope,
    pub five_tuple: FiveTuple,
    pub labels: Labels,
    /// Tag naming the parser that produced `payload`, or `raw`.
    pub payload_type: String,
    /// Parsed payload; opaque to the engine.
    pub payload: serde_json::Value,
    /// Raw application bytes, when the task keeps them.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub raw: Option<Vec<u8>>,
}
