// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! SIP signalling parser.
//!
//! Extracts the request/response line and the correlation headers, and
//! publishes the RTP flow advertised in an SDP body into the task's flow
//! registry so the RTP parser can recognise the media in O(1).

use crate::plugins::expected_media_key;
use flow::{FlowRegistry, SessionState};
use net::DecodedPacket;
use plugin::{Labels, Parser, Plugin, PluginError};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

const SIP_METHODS: &[&str] = &[
    "INVITE",
    "ACK",
    "BYE",
    "CANCEL",
    "REGISTER",
    "OPTIONS",
    "SUBSCRIBE",
    "NOTIFY",
    "INFO",
    "UPDATE",
    "PRACK",
    "REFER",
    "MESSAGE",
];

fn looks_like_sip(payload: &[u8]) -> bool {
    if payload.starts_with(b"SIP/2.0 ") {
        return true;
    }
    SIP_METHODS.iter().any(|method| {
        payload.len() > method.len()
            && payload.starts_with(method.as_bytes())
            && payload[method.len()] == b' '
    })
}

#[derive(Default)]
struct SdpMedia {
    addr: Option<IpAddr>,
    port: Option<u16>,
    codec: Option<String>,
}

fn scan_sdp(body: &str) -> SdpMedia {
    let mut media = SdpMedia::default();
    for line in body.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("m=audio ") {
            media.port = rest.split_whitespace().next().and_then(|p| p.parse().ok());
        } else if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            media.addr = rest.trim().parse().ok().map(IpAddr::V4);
        } else if let Some(rest) = line.strip_prefix("c=IN IP6 ") {
            media.addr = rest.trim().parse().ok().map(IpAddr::V6);
        } else if media.codec.is_none() {
            if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                media.codec = rest
                    .split_whitespace()
                    .nth(1)
                    .and_then(|encoding| encoding.split('/').next())
                    .map(str::to_owned);
            }
        }
    }
    media
}

/// SIP request/response classifier.
#[derive(Default)]
pub struct SipParser {
    registry: Option<Arc<FlowRegistry>>,
}

impl Plugin for SipParser {
    fn name(&self) -> &'static str {
        "sip"
    }
}

impl Parser for SipParser {
    fn can_handle(&self, pkt: &DecodedPacket) -> bool {
        pkt.transport.is_some() && looks_like_sip(pkt.payload)
    }

    fn handle(&mut self, pkt: &DecodedPacket) -> Result<(serde_json::Value, Labels), PluginError> {
        let text = String::from_utf8_lossy(pkt.payload);
        let (head, body) = text
            .split_once("\r\n\r\n")
            .or_else(|| text.split_once("\n\n"))
            .unwrap_or((text.as_ref(), ""));
        let mut lines = head.lines();
        let start_line = lines
            .next()
            .ok_or_else(|| PluginError::Failed("empty sip payload".to_owned()))?;

        let mut labels = Labels::new();
        let mut method = None;
        let mut status = None;
        if let Some(rest) = start_line.strip_prefix("SIP/2.0 ") {
            let code = rest.split_whitespace().next().unwrap_or("");
            labels.set("sip.status", code);
            status = Some(code.to_owned());
        } else {
            let verb = start_line.split_whitespace().next().unwrap_or("");
            labels.set("sip.method", verb);
            method = Some(verb.to_owned());
        }

        let mut call_id = String::new();
        let mut from = String::new();
        let mut to = String::new();
        let mut cseq = String::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "call-id" | "i" => call_id = value.to_owned(),
                "from" | "f" => from = value.to_owned(),
                "to" | "t" => to = value.to_owned(),
                "cseq" => cseq = value.to_owned(),
                _ => {}
            }
        }
        if !call_id.is_empty() {
            labels.set("sip.call_id", call_id.clone());
        }
        if !from.is_empty() {
            labels.set("sip.from", from.clone());
        }
        if !to.is_empty() {
            labels.set("sip.to", to.clone());
        }
        if !cseq.is_empty() {
            labels.set("sip.cseq", cseq.clone());
        }

        self.publish_media(body, &call_id);

        let parsed = serde_json::json!({
            "method": method,
            "status": status,
            "call_id": call_id,
            "from": from,
            "to": to,
            "cseq": cseq,
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

impl SipParser {
    /// Publish the RTP flow an SDP body advertises, keyed so either media
    /// direction finds it.
    fn publish_media(&self, body: &str, call_id: &str) {
        let Some(registry) = &self.registry else {
            return;
        };
        if body.is_empty() {
            return;
        }
        let media = scan_sdp(body);
        let (Some(addr), Some(port)) = (media.addr, media.port) else {
            return;
        };
        let mut session = SessionState::new();
        session.set("call_id", call_id);
        if let Some(codec) = &media.codec {
            session.set("codec", codec.clone());
        }
        registry.set(expected_media_key(addr, port), session);
        debug!(%addr, port, call_id, "published expected rtp flow");
    }
}
