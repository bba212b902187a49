// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! Built-in plugins, registered into the global factory slice at link time.

mod afpacket;
mod console;
mod filter;
mod rtp;
mod sip;

pub use afpacket::AfpacketCapturer;
pub use console::ConsoleReporter;
pub use filter::FilterProcessor;
pub use rtp::RtpParser;
pub use sip::SipParser;

use flow::FlowKey;
use linkme::distributed_slice;
use plugin::{Capturer, PLUGINS, Parser, PluginCtor, PluginRegistration, Processor, Reporter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Registry key for an RTP flow advertised in signalling: destination side
/// only, source side wildcarded. The SIP parser writes it, the RTP parser
/// probes it for both media directions.
pub(crate) fn expected_media_key(addr: IpAddr, port: u16) -> FlowKey {
    let unspecified = match addr {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    FlowKey::new(unspecified, 0, addr, port, 17)
}

fn make_afpacket() -> Box<dyn Capturer> {
    Box::new(AfpacketCapturer::default())
}

fn make_console() -> Box<dyn Reporter> {
    Box::new(ConsoleReporter::default())
}

fn make_sip() -> Box<dyn Parser> {
    Box::new(SipParser::default())
}

fn make_rtp() -> Box<dyn Parser> {
    Box::new(RtpParser::default())
}

fn make_filter() -> Box<dyn Processor> {
    Box::new(FilterProcessor::default())
}

#[distributed_slice(PLUGINS)]
static AFPACKET_CAPTURER: PluginRegistration =
    PluginRegistration::new("afpacket", PluginCtor::Capturer(make_afpacket));

#[distributed_slice(PLUGINS)]
static CONSOLE_REPORTER: PluginRegistration =
    PluginRegistration::new("console", PluginCtor::Reporter(make_console));

#[distributed_slice(PLUGINS)]
static SIP_PARSER: PluginRegistration =
    PluginRegistration::new("sip", PluginCtor::Parser(make_sip));

#[distributed_slice(PLUGINS)]
static RTP_PARSER: PluginRegistration =
    PluginRegistration::new("rtp", PluginCtor::Parser(make_rtp));

#[distributed_slice(PLUGINS)]
static FILTER_PROCESSOR: PluginRegistration =
    PluginRegistration::new("filter", PluginCtor::Processor(make_filter));
