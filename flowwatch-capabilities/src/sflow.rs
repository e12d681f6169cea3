//! sFlow v5 over UDP.
//!
//! Only flow samples are decoded, and within them only sampled packet
//! headers. Counter samples and vendor structures are skipped. Each sampled
//! header yields one record: bytes is the original frame length and packets
//! is 1. sFlow carries no export clock, so records are stamped with the time
//! the datagram was received.

use std::net::IpAddr;

use flowwatch_core::{Capability, DecodeError, Decoder, LoadError, RawDatagram};
use flowwatch_types::{Endpoint, FlowRecord, FlowTimestamp, ProtocolTag};
use tracing::trace;

use crate::udp::UdpCapability;
use crate::wire::Reader;

pub const IDENTIFIER: &str = "sflow_udp";
pub const DEFAULT_BIND: &str = "0.0.0.0:6343";

const VERSION: u32 = 5;
const AGENT_IPV4: u32 = 1;
const AGENT_IPV6: u32 = 2;

const FLOW_SAMPLE: u32 = 1;
const EXPANDED_FLOW_SAMPLE: u32 = 3;
const SAMPLED_HEADER: u32 = 1;
const HEADER_PROTOCOL_ETHERNET: u32 = 1;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;
const MAX_VLAN_TAGS: usize = 2;

/// Build the sFlow capability under `identifier`.
pub fn load(identifier: &str) -> Result<Box<dyn Capability>, LoadError> {
    Ok(Box::new(UdpCapability::new(
        identifier,
        ProtocolTag::Sflow,
        DEFAULT_BIND,
        |id: &str| Box::new(SflowDecoder::new(id)) as Box<dyn Decoder>,
    )))
}

#[derive(Debug, Clone)]
pub struct SflowDecoder {
    identifier: String,
}

impl SflowDecoder {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }
}

/// Split an sFlow data-format tag into (enterprise, format).
fn split_tag(tag: u32) -> (u32, u32) {
    (tag >> 12, tag & 0xFFF)
}

impl Decoder for SflowDecoder {
    fn decode(&mut self, datagram: &RawDatagram) -> Result<Vec<FlowRecord>, DecodeError> {
        let mut r = Reader::new(&datagram.payload);
        let version = r.u32("sflow header")?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion {
                protocol: "sflow",
                version,
            });
        }
        match r.u32("sflow header")? {
            AGENT_IPV4 => r.skip(4, "sflow agent address")?,
            AGENT_IPV6 => r.skip(16, "sflow agent address")?,
            other => {
                return Err(DecodeError::Malformed(format!(
                    "sflow agent address type {other}"
                )))
            }
        }
        let _sub_agent = r.u32("sflow header")?;
        let _sequence = r.u32("sflow header")?;
        let _uptime = r.u32("sflow header")?;
        let samples = r.u32("sflow header")?;

        let timestamp = FlowTimestamp::new(datagram.received_unix_ms, datagram.received);
        let mut records = Vec::new();

        for _ in 0..samples {
            let (enterprise, format) = split_tag(r.u32("sample header")?);
            let length = r.u32("sample header")? as usize;
            let mut sample = r.sub(length, "sample body")?;
            if enterprise != 0 {
                continue;
            }

            match format {
                FLOW_SAMPLE => sample.skip(7 * 4, "flow sample")?,
                EXPANDED_FLOW_SAMPLE => sample.skip(10 * 4, "expanded flow sample")?,
                other => {
                    trace!(format = other, "non-flow sample skipped");
                    continue;
                }
            }

            let count = sample.u32("flow sample")?;
            for _ in 0..count {
                let (enterprise, format) = split_tag(sample.u32("flow record header")?);
                let length = sample.u32("flow record header")? as usize;
                let mut body = sample.sub(length, "flow record")?;
                if enterprise != 0 || format != SAMPLED_HEADER {
                    continue;
                }
                if let Some(record) = self.sampled_header(&mut body, timestamp)? {
                    records.push(record);
                }
            }
        }

        Ok(records)
    }
}

impl SflowDecoder {
    fn sampled_header(
        &self,
        body: &mut Reader<'_>,
        timestamp: FlowTimestamp,
    ) -> Result<Option<FlowRecord>, DecodeError> {
        let header_protocol = body.u32("sampled header")?;
        let frame_length = body.u32("sampled header")?;
        let _stripped = body.u32("sampled header")?;
        let header_length = body.u32("sampled header")? as usize;
        let header = body.bytes(header_length, "sampled header bytes")?;

        if header_protocol != HEADER_PROTOCOL_ETHERNET {
            return Ok(None);
        }
        // A snapshot too short to reach the addresses is not an error, just unusable.
        let Some(packet) = parse_ethernet(header) else {
            trace!(header_length, "sampled header without an IP packet");
            return Ok(None);
        };

        let record = FlowRecord::builder(self.identifier.as_str(), ProtocolTag::Sflow)
            .timestamp(timestamp)
            .source(Endpoint::new(packet.src, packet.src_port))
            .destination(Endpoint::new(packet.dst, packet.dst_port))
            .transport(packet.protocol)
            .byte_count(u64::from(frame_length))
            .packet_count(1)
            .build();
        Ok(Some(record))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SampledPacket {
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    src_port: Option<u16>,
    dst_port: Option<u16>,
}

fn parse_ethernet(frame: &[u8]) -> Option<SampledPacket> {
    let mut r = Reader::new(frame);
    r.skip(12, "ethernet addresses").ok()?;
    let mut ethertype = r.u16("ethertype").ok()?;
    for _ in 0..MAX_VLAN_TAGS {
        if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
            break;
        }
        r.skip(2, "vlan tag").ok()?;
        ethertype = r.u16("ethertype").ok()?;
    }

    let (src, dst, protocol, mut l4) = match ethertype {
        ETHERTYPE_IPV4 => {
            let mut ip = r.clone();
            let ihl = usize::from(ip.u8("ipv4 header").ok()? & 0x0F) * 4;
            if ihl < 20 {
                return None;
            }
            ip.skip(8, "ipv4 header").ok()?;
            let protocol = ip.u8("ipv4 header").ok()?;
            ip.skip(2, "ipv4 checksum").ok()?;
            let src = IpAddr::V4(ip.ipv4("ipv4 source").ok()?);
            let dst = IpAddr::V4(ip.ipv4("ipv4 destination").ok()?);
            r.skip(ihl, "ipv4 header").ok()?;
            (src, dst, protocol, r)
        }
        ETHERTYPE_IPV6 => {
            r.skip(6, "ipv6 header").ok()?;
            let next_header = r.u8("ipv6 header").ok()?;
            r.skip(1, "ipv6 hop limit").ok()?;
            let src = IpAddr::V6(r.ipv6("ipv6 source").ok()?);
            let dst = IpAddr::V6(r.ipv6("ipv6 destination").ok()?);
            (src, dst, next_header, r)
        }
        _ => return None,
    };

    // TCP, UDP and SCTP all lead with the two ports.
    let (src_port, dst_port) = match protocol {
        6 | 17 | 132 => match (l4.u16("source port"), l4.u16("destination port")) {
            (Ok(s), Ok(d)) => (Some(s), Some(d)),
            _ => (None, None),
        },
        _ => (None, None),
    };

    Some(SampledPacket {
        src,
        dst,
        protocol,
        src_port,
        dst_port,
    })
}
