// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! RTP media parser with SIP correlation via the flow registry.

use crate::plugins::expected_media_key;
use flow::FlowRegistry;
use net::DecodedPacket;
use plugin::{Labels, Parser, Plugin, PluginError};
use std::sync::Arc;

const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// Classifies RTP packets and, when the signalling parser published the
/// session, copies its `call_id` and `codec` onto the record. Other session
/// keys are ignored.
#[derive(Default)]
pub struct RtpParser {
    registry: Option<Arc<FlowRegistry>>,
}

impl Plugin for RtpParser {
    fn name(&self) -> &'static str {
        "rtp"
    }
}

impl Parser for RtpParser {
    fn can_handle(&self, pkt: &DecodedPacket) -> bool {
        let udp = pkt
            .transport
            .as_ref()
            .is_some_and(|t| t.protocol == 17 && t.tcp.is_none());
        udp && pkt.payload.len() >= RTP_HEADER_LEN && pkt.payload[0] >> 6 == RTP_VERSION
    }

    fn handle(&mut self, pkt: &DecodedPacket) -> Result<(serde_json::Value, Labels), PluginError> {
        let payload = pkt.payload;
        if payload.len() < RTP_HEADER_LEN {
            return Err(PluginError::Failed("short rtp header".to_owned()));
        }
        let payload_type = payload[1] & 0x7F;
        let marker = payload[1] >> 7 == 1;
        let sequence = u16::from_be_bytes([payload[2], payload[3]]);
        let timestamp = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let ssrc = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);

        let mut labels = Labels::new();
        labels.set("rtp.payload_type", payload_type.to_string());
        labels.set("rtp.seq", sequence.to_string());
        labels.set("rtp.ssrc", format!("{ssrc:#010x}"));

        if let (Some(registry), Some(ip), Some(transport)) =
            (&self.registry, pkt.ip.as_ref(), pkt.transport.as_ref())
        {
            // Media can arrive toward the advertised endpoint or from it.
            let session = registry
                .get(&expected_media_key(ip.dst, transport.dst_port))
                .or_else(|| registry.get(&expected_media_key(ip.src, transport.src_port)));
            if let Some(session) = session {
                let call_id = session.get("call_id");
                if !call_id.is_empty() {
                    labels.set("rtp.call_id", call_id);
                }
                let codec = session.get("codec");
                if !codec.is_empty() {
                    labels.set("rtp.codec", codec);
                }
            }
        }

        let parsed = serde_json::json!({
            "payload_type": payload_type,
            "marker": marker,
            "sequence": sequence,
            "timestamp": timestamp,
            "ssrc": ssrc,
        });
        Ok((parsed, labels))
    }

    fn needs_flow_registry(&self) -> bool {
        true
    }

    fn bind_flow_registry(&mut self, registry: Arc<FlowRegistry>) {
        self.registry = Some(registry);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use flow::SessionState;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::time::SystemTime;

    fn rtp_payload(pt: u8, seq: u16, ssrc: u32) -> Vec<u8> {
        let mut buf = vec![0x80, pt];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(&[0u8; 160]);
        buf
    }

    fn decoded(payload: &[u8], dst_port: u16) -> DecodedPacket<'_> {
        DecodedPacket {
            timestamp: SystemTime::UNIX_EPOCH,
            eth: net::EthMeta {
                src_mac: [2, 0, 0, 0, 0, 1],
                dst_mac: [2, 0, 0, 0, 0, 2],
                ether_type: net::ETH_P_IPV4,
                vlan_ids: arrayvec::ArrayVec::new(),
            },
            ip: Some(net::IpMeta {
                version: 4,
                src: Ipv4Addr::new(192, 168, 1, 1).into(),
                dst: Ipv4Addr::new(192, 168, 1, 50).into(),
                protocol: 17,
                ttl: 64,
                total_len: 0,
                inner_src: None,
                inner_dst: None,
                fragment: None,
            }),
            transport: Some(net::TransportMeta {
                protocol: 17,
                src_port: 30000,
                dst_port,
                tcp: None,
            }),
            payload,
            l3_offset: Some(14),
            reassembled: false,
        }
    }

    #[test]
    fn version_gate() {
        let parser = RtpParser::default();
        let good = rtp_payload(0, 1, 0xDEAD_BEEF);
        assert!(parser.can_handle(&decoded(&good, 49170)));
        let mut bad = good.clone();
        bad[0] = 0x40; // version 1
        assert!(!parser.can_handle(&decoded(&bad, 49170)));
        assert!(!parser.can_handle(&decoded(&good[..8], 49170)));
    }

    #[test]
    fn parses_header_fields() {
        let mut parser = RtpParser::default();
        let payload = rtp_payload(8, 4242, 0x1122_3344);
        let (parsed, labels) = parser.handle(&decoded(&payload, 49170)).unwrap();
        assert_eq!(labels.get("rtp.payload_type"), "8");
        assert_eq!(labels.get("rtp.seq"), "4242");
        assert_eq!(labels.get("rtp.ssrc"), "0x11223344");
        assert_eq!(parsed["sequence"], 4242);
        assert_eq!(parsed["ssrc"], 0x1122_3344u32);
    }

    #[test]
    fn correlates_with_published_session() {
        let registry = Arc::new(FlowRegistry::new());
        let mut session = SessionState::new();
        session.set("call_id", "a84b4c76e66710@pc33.example.com");
        session.set("codec", "PCMU");
        session.set("something_else", "ignored");
        registry.set(
            expected_media_key(Ipv4Addr::new(192, 168, 1, 50).into(), 49170),
            session,
        );

        let mut parser = RtpParser::default();
        parser.bind_flow_registry(Arc::clone(&registry));
        let payload = rtp_payload(0, 1, 7);
        let (_, labels) = parser.handle(&decoded(&payload, 49170)).unwrap();
        assert_eq!(labels.get("rtp.call_id"), "a84b4c76e66710@pc33.example.com");
        assert_eq!(labels.get("rtp.codec"), "PCMU");
        assert!(!labels.contains("rtp.something_else"));
    }

    #[test]
    fn uncorrelated_media_still_parses() {
        let mut parser = RtpParser::default();
        parser.bind_flow_registry(Arc::new(FlowRegistry::new()));
        let payload = rtp_payload(0, 1, 7);
        let (_, labels) = parser.handle(&decoded(&payload, 40000)).unwrap();
        assert!(!labels.contains("rtp.call_id"));
        assert_eq!(labels.get("rtp.payload_type"), "0");
    }
}
