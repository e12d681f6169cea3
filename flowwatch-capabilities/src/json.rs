//! JSON-over-UDP test format.
//!
//! A datagram carries one JSON object, an array of objects, or several
//! objects separated by newlines:
//!
//! ```json
//! {"ts": 1703160000.25, "src": "10.0.0.1", "dst": "10.0.0.2",
//!  "src_port": 40312, "dst_port": 443, "proto": "TCP",
//!  "latency_ms": 12.5, "bytes": 1500, "packets": 3}
//! ```
//!
//! Every field is optional. `bytes`/`packets` may also be spelled
//! `byte_count`/`packet_count`; `proto` is a name or an IP protocol number;
//! `ts` is unix seconds and defaults to the receive time.

use std::net::IpAddr;

use flowwatch_core::{Capability, DecodeError, Decoder, LoadError, RawDatagram};
use flowwatch_types::{Endpoint, FlowRecord, FlowTimestamp, ProtocolTag};
use serde::Deserialize;

use crate::udp::UdpCapability;

pub const IDENTIFIER: &str = "json_udp";
pub const DEFAULT_BIND: &str = "0.0.0.0:9995";

/// Build the JSON capability under `identifier`.
pub fn load(identifier: &str) -> Result<Box<dyn Capability>, LoadError> {
    Ok(Box::new(UdpCapability::new(
        identifier,
        ProtocolTag::Json,
        DEFAULT_BIND,
        |id: &str| Box::new(JsonDecoder::new(id)) as Box<dyn Decoder>,
    )))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Transport {
    Number(u8),
    Name(String),
}

impl Transport {
    fn number(&self) -> Result<u8, DecodeError> {
        match self {
            Transport::Number(n) => Ok(*n),
            Transport::Name(name) => match name.to_ascii_uppercase().as_str() {
                "TCP" => Ok(6),
                "UDP" => Ok(17),
                "ICMP" => Ok(1),
                "ICMPV6" => Ok(58),
                "SCTP" => Ok(132),
                other => other
                    .parse()
                    .map_err(|_| DecodeError::Malformed(format!("unknown proto `{name}`"))),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonFlow {
    ts: Option<f64>,
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    proto: Option<Transport>,
    latency_ms: Option<f64>,
    #[serde(alias = "bytes")]
    byte_count: Option<u64>,
    #[serde(alias = "packets")]
    packet_count: Option<u64>,
}

/// Decoder for the JSON test format. Stateless apart from its identifier.
#[derive(Debug, Clone)]
pub struct JsonDecoder {
    identifier: String,
}

impl JsonDecoder {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn record(&self, flow: JsonFlow, datagram: &RawDatagram) -> Result<FlowRecord, DecodeError> {
        let unix_ms = match flow.ts {
            Some(ts) if ts.is_finite() && ts >= 0.0 => (ts * 1000.0).round() as u64,
            Some(ts) => return Err(DecodeError::Malformed(format!("invalid ts {ts}"))),
            None => datagram.received_unix_ms,
        };

        let mut builder = FlowRecord::builder(&self.identifier, ProtocolTag::Json)
            .timestamp(FlowTimestamp::new(unix_ms, datagram.received));

        if let Some(src) = flow.src {
            builder = builder.source(Endpoint::new(src, flow.src_port));
        }
        if let Some(dst) = flow.dst {
            builder = builder.destination(Endpoint::new(dst, flow.dst_port));
        }
        if let Some(proto) = &flow.proto {
            builder = builder.transport(proto.number()?);
        }
        if let Some(bytes) = flow.byte_count {
            builder = builder.byte_count(bytes);
        }
        if let Some(packets) = flow.packet_count {
            builder = builder.packet_count(packets);
        }
        if let Some(latency) = flow.latency_ms {
            if !latency.is_finite() || latency < 0.0 {
                return Err(DecodeError::Malformed(format!("invalid latency_ms {latency}")));
            }
            builder = builder.latency_ms(latency);
        }

        Ok(builder.build())
    }
}

impl Decoder for JsonDecoder {
    fn decode(&mut self, datagram: &RawDatagram) -> Result<Vec<FlowRecord>, DecodeError> {
        let payload = trim_whitespace(&datagram.payload);
        let flows: Vec<JsonFlow> = match payload.first() {
            None => return Err(DecodeError::Malformed("empty payload".into())),
            Some(b'[') => serde_json::from_slice(payload)?,
            Some(_) => serde_json::Deserializer::from_slice(payload)
                .into_iter::<JsonFlow>()
                .collect::<Result<_, _>>()?,
        };

        flows
            .into_iter()
            .map(|flow| self.record(flow, datagram))
            .collect()
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn datagram(payload: &str) -> RawDatagram {
        RawDatagram::now(SocketAddr::from(([127, 0, 0, 1], 5000)), payload.as_bytes().to_vec())
    }

    fn decode(payload: &str) -> Result<Vec<FlowRecord>, DecodeError> {
        JsonDecoder::new(IDENTIFIER).decode(&datagram(payload))
    }

    #[test]
    fn decodes_full_object() {
        let records = decode(
            r#"{"ts": 1703160000.5, "src": "10.0.0.1", "dst": "10.0.0.2",
                "src_port": 1111, "dst_port": 443, "proto": "TCP",
                "latency_ms": 123.0, "bytes": 10, "packets": 1}"#,
        )
        .unwrap();

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.source_capability(), "json_udp");
        assert_eq!(r.raw_protocol_tag(), ProtocolTag::Json);
        assert_eq!(r.latency_ms(), Some(123.0));
        assert_eq!(r.byte_count(), Some(10));
        assert_eq!(r.packet_count(), Some(1));
        assert_eq!(r.transport(), Some(6));
        assert_eq!(r.timestamp().unix_ms, 1_703_160_000_500);
        assert_eq!(
            r.source_address(),
            Some(Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), Some(1111)))
        );
        assert_eq!(r.flow_key().as_deref(), Some("10.0.0.1:1111->10.0.0.2:443/TCP"));
    }

    #[test]
    fn minimal_object_leaves_fields_unknown() {
        let dg = datagram(r#"{"latency_ms": 5, "byte_count": 100}"#);
        let records = JsonDecoder::new("json_udp").decode(&dg).unwrap();
        let r = &records[0];

        assert_eq!(r.latency_ms(), Some(5.0));
        assert_eq!(r.byte_count(), Some(100));
        assert_eq!(r.packet_count(), None);
        assert_eq!(r.source_address(), None);
        assert_eq!(r.transport(), None);
        assert_eq!(r.timestamp().unix_ms, dg.received_unix_ms);
        assert_eq!(r.timestamp().received, dg.received);
    }

    #[test]
    fn arrays_and_lines_yield_many_records() {
        let array = decode(r#"[{"latency_ms": 1}, {"latency_ms": 2}]"#).unwrap();
        assert_eq!(array.len(), 2);

        let lines = decode("{\"latency_ms\": 1}\n{\"latency_ms\": 2}\n{\"latency_ms\": 3}\n").unwrap();
        let latencies: Vec<Option<f64>> = lines.iter().map(|r| r.latency_ms()).collect();
        assert_eq!(latencies, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn numeric_proto_is_accepted() {
        let records = decode(r#"{"proto": 17}"#).unwrap();
        assert_eq!(records[0].transport(), Some(17));

        let records = decode(r#"{"proto": "udp"}"#).unwrap();
        assert_eq!(records[0].transport(), Some(17));
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(decode("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode("   "), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(r#"{"latency_ms": -4}"#), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(r#"{"src": "999.1.1.1"}"#), Err(DecodeError::Json(_))));
        assert!(matches!(decode(r#"{"proto": "QUIC"}"#), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(r#"{"latency_ms": 1"#), Err(DecodeError::Json(_))));
    }

    #[test]
    fn one_bad_object_fails_the_datagram() {
        let result = decode("{\"latency_ms\": 1}\n{\"latency_ms\": \"slow\"}");
        assert!(result.is_err());
    }

    #[test]
    fn loader_builds_capability() {
        let cap = load("lab_json").unwrap();
        assert_eq!(cap.identifier(), "lab_json");
        assert_eq!(cap.protocol(), ProtocolTag::Json);
        assert_eq!(cap.default_bind().addr, DEFAULT_BIND);
    }
}
