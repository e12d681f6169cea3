//! The normalized flow record every decoder produces.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wire protocol a record was decoded from. Kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProtocolTag {
    Sflow,
    Netflow,
    Jflow,
    Ipfix,
    Json,
}

impl ProtocolTag {
    /// All known tags, in display order.
    pub const ALL: [ProtocolTag; 5] = [
        ProtocolTag::Sflow,
        ProtocolTag::Netflow,
        ProtocolTag::Jflow,
        ProtocolTag::Ipfix,
        ProtocolTag::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Sflow => "sflow",
            ProtocolTag::Netflow => "netflow",
            ProtocolTag::Jflow => "jflow",
            ProtocolTag::Ipfix => "ipfix",
            ProtocolTag::Json => "json",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown protocol tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProtocolTag(pub String);

impl fmt::Display for UnknownProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol tag: {}", self.0)
    }
}

impl std::error::Error for UnknownProtocolTag {}

impl FromStr for ProtocolTag {
    type Err = UnknownProtocolTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtocolTag::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownProtocolTag(s.to_string()))
    }
}

/// One side of a flow: an IP address and, for port-bearing transports, a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
    pub address: IpAddr,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: Option<u16>) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address, self.port) {
            (IpAddr::V4(v4), Some(port)) => write!(f, "{}:{}", v4, port),
            (IpAddr::V6(v6), Some(port)) => write!(f, "[{}]:{}", v6, port),
            (addr, None) => write!(f, "{}", addr),
        }
    }
}

/// When a record was observed.
///
/// `unix_ms` is wall-clock time, resolved against the exporting protocol's
/// own clock where the wire format carries one. `received` is the monotonic
/// instant the datagram arrived and drives window eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlowTimestamp {
    pub unix_ms: u64,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub received: Instant,
}

impl FlowTimestamp {
    pub fn new(unix_ms: u64, received: Instant) -> Self {
        Self { unix_ms, received }
    }

    /// A timestamp for "right now" on both clocks.
    pub fn now() -> Self {
        Self {
            unix_ms: current_timestamp_ms(),
            received: Instant::now(),
        }
    }

    /// Keep the monotonic receive instant but replace the wall-clock time.
    pub fn with_unix_ms(self, unix_ms: u64) -> Self {
        Self { unix_ms, ..self }
    }
}

/// A normalized, protocol-independent flow observation.
///
/// Records are immutable once built. Counters the exporter did not report are
/// `None`; a record without `latency_ms` still counts as a flow but is ignored
/// by latency statistics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlowRecord {
    source_capability: String,
    timestamp: FlowTimestamp,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    source_address: Option<Endpoint>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    destination_address: Option<Endpoint>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    transport: Option<u8>,
    byte_count: Option<u64>,
    packet_count: Option<u64>,
    latency_ms: Option<f64>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    flow_start_ms: Option<u64>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    flow_end_ms: Option<u64>,
    raw_protocol_tag: ProtocolTag,
}

impl FlowRecord {
    /// Start building a record produced by `capability` from `protocol`.
    pub fn builder(capability: impl Into<String>, protocol: ProtocolTag) -> FlowRecordBuilder {
        FlowRecordBuilder::new(capability, protocol)
    }

    pub fn source_capability(&self) -> &str {
        &self.source_capability
    }

    pub fn timestamp(&self) -> FlowTimestamp {
        self.timestamp
    }

    pub fn source_address(&self) -> Option<Endpoint> {
        self.source_address
    }

    pub fn destination_address(&self) -> Option<Endpoint> {
        self.destination_address
    }

    /// IP protocol number (6 = TCP, 17 = UDP, ...), if known.
    pub fn transport(&self) -> Option<u8> {
        self.transport
    }

    pub fn byte_count(&self) -> Option<u64> {
        self.byte_count
    }

    pub fn packet_count(&self) -> Option<u64> {
        self.packet_count
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms
    }

    pub fn flow_start_ms(&self) -> Option<u64> {
        self.flow_start_ms
    }

    pub fn flow_end_ms(&self) -> Option<u64> {
        self.flow_end_ms
    }

    pub fn raw_protocol_tag(&self) -> ProtocolTag {
        self.raw_protocol_tag
    }

    /// Group key similar to a 5-tuple: `src:port->dst:port/transport`.
    ///
    /// Returns `None` for aggregate samples missing either endpoint.
    pub fn flow_key(&self) -> Option<String> {
        let src = self.source_address?;
        let dst = self.destination_address?;
        Some(format!(
            "{}->{}/{}",
            src,
            dst,
            transport_name(self.transport)
        ))
    }
}

/// Human-readable name for an IP protocol number.
pub fn transport_name(transport: Option<u8>) -> String {
    match transport {
        Some(1) => "ICMP".to_string(),
        Some(6) => "TCP".to_string(),
        Some(17) => "UDP".to_string(),
        Some(58) => "ICMPv6".to_string(),
        Some(132) => "SCTP".to_string(),
        Some(other) => other.to_string(),
        None => "?".to_string(),
    }
}

/// Builder for [`FlowRecord`].
#[derive(Debug, Clone)]
pub struct FlowRecordBuilder {
    record: FlowRecord,
}

impl FlowRecordBuilder {
    pub fn new(capability: impl Into<String>, protocol: ProtocolTag) -> Self {
        Self {
            record: FlowRecord {
                source_capability: capability.into(),
                timestamp: FlowTimestamp::now(),
                source_address: None,
                destination_address: None,
                transport: None,
                byte_count: None,
                packet_count: None,
                latency_ms: None,
                flow_start_ms: None,
                flow_end_ms: None,
                raw_protocol_tag: protocol,
            },
        }
    }

    pub fn timestamp(mut self, timestamp: FlowTimestamp) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    pub fn source(mut self, endpoint: Endpoint) -> Self {
        self.record.source_address = Some(endpoint);
        self
    }

    pub fn destination(mut self, endpoint: Endpoint) -> Self {
        self.record.destination_address = Some(endpoint);
        self
    }

    pub fn transport(mut self, protocol: u8) -> Self {
        self.record.transport = Some(protocol);
        self
    }

    pub fn byte_count(mut self, bytes: u64) -> Self {
        self.record.byte_count = Some(bytes);
        self
    }

    pub fn packet_count(mut self, packets: u64) -> Self {
        self.record.packet_count = Some(packets);
        self
    }

    /// Attach a latency sample. Non-finite or negative values are dropped,
    /// leaving the record without latency.
    pub fn latency_ms(mut self, latency: f64) -> Self {
        self.record.latency_ms = (latency.is_finite() && latency >= 0.0).then_some(latency);
        self
    }

    pub fn flow_start_ms(mut self, unix_ms: u64) -> Self {
        self.record.flow_start_ms = Some(unix_ms);
        self
    }

    pub fn flow_end_ms(mut self, unix_ms: u64) -> Self {
        self.record.flow_end_ms = Some(unix_ms);
        self
    }

    pub fn build(self) -> FlowRecord {
        self.record
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
