//! Template model shared by the NetFlow v9 and IPFIX decoders.
//!
//! Both protocols describe data records with templates announced in-band.
//! Templates are cached per decoder instance, keyed by exporter address,
//! source id (v9) or observation domain (IPFIX), and template id.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use flowwatch_core::DecodeError;
use flowwatch_types::{Endpoint, FlowRecord, FlowTimestamp, ProtocolTag};

use crate::wire::{be_uint, ip_from, Reader};

/// Field length marking an IPFIX variable-length field.
pub(crate) const VARIABLE_LENGTH: u16 = 0xFFFF;

/// Upper bound on templates held by one decoder.
pub(crate) const MAX_TEMPLATES: usize = 4096;

// Information element ids understood by the normalizer.
const OCTET_DELTA_COUNT: u16 = 1;
const PACKET_DELTA_COUNT: u16 = 2;
const PROTOCOL_IDENTIFIER: u16 = 4;
const SOURCE_TRANSPORT_PORT: u16 = 7;
const SOURCE_IPV4_ADDRESS: u16 = 8;
const DESTINATION_TRANSPORT_PORT: u16 = 11;
const DESTINATION_IPV4_ADDRESS: u16 = 12;
const LAST_SWITCHED: u16 = 21;
const FIRST_SWITCHED: u16 = 22;
const SOURCE_IPV6_ADDRESS: u16 = 27;
const DESTINATION_IPV6_ADDRESS: u16 = 28;
const OCTET_TOTAL_COUNT: u16 = 85;
const PACKET_TOTAL_COUNT: u16 = 86;
const FLOW_START_SECONDS: u16 = 150;
const FLOW_END_SECONDS: u16 = 151;
const FLOW_START_MILLISECONDS: u16 = 152;
const FLOW_END_MILLISECONDS: u16 = 153;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldSpec {
    pub id: u16,
    pub length: u16,
    /// Private enterprise number for vendor-specific IPFIX elements.
    pub enterprise: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Template {
    pub fields: Vec<FieldSpec>,
    /// Options templates describe exporter metadata, not flows.
    pub options: bool,
}

impl Template {
    /// Smallest number of bytes a data record can occupy.
    pub fn min_record_length(&self) -> usize {
        self.fields
            .iter()
            .map(|f| {
                if f.length == VARIABLE_LENGTH {
                    1
                } else {
                    usize::from(f.length)
                }
            })
            .sum()
    }
}

pub(crate) type TemplateKey = (IpAddr, u32, u16);

/// Bounded template store, evicting the oldest announcement when full.
#[derive(Debug)]
pub(crate) struct TemplateCache {
    templates: HashMap<TemplateKey, Template>,
    order: VecDeque<TemplateKey>,
    capacity: usize,
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::with_capacity(MAX_TEMPLATES)
    }
}

impl TemplateCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            templates: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, key: TemplateKey, template: Template) {
        if self.templates.insert(key, template).is_none() {
            self.order.push_back(key);
            while self.templates.len() > self.capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.templates.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }

    pub fn get(&self, key: &TemplateKey) -> Option<&Template> {
        self.templates.get(key)
    }

    pub fn remove(&mut self, key: &TemplateKey) {
        if self.templates.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    /// Drop every template of one exporter domain, optionally only options templates.
    pub fn remove_domain(&mut self, exporter: IpAddr, domain: u32, options: Option<bool>) {
        self.templates.retain(|(ip, d, _), t| {
            !(*ip == exporter && *d == domain && options.map_or(true, |o| t.options == o))
        });
        let templates = &self.templates;
        self.order.retain(|k| templates.contains_key(k));
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }
}

/// Export-time context needed to turn relative timestamps into unix ms.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExportClock {
    pub export_unix_ms: u64,
    /// Exporter uptime at export, for protocols that report it.
    pub sys_uptime_ms: Option<u32>,
}

impl ExportClock {
    /// Unix ms of an event stamped with exporter uptime `at_uptime_ms`.
    pub fn resolve_uptime(&self, at_uptime_ms: u32) -> Option<u64> {
        let uptime = self.sys_uptime_ms?;
        let ago = u64::from(uptime.wrapping_sub(at_uptime_ms));
        self.export_unix_ms.checked_sub(ago)
    }
}

/// Normalizable fields pulled out of one data record.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct FlowFields {
    pub src_addr: Option<IpAddr>,
    pub dst_addr: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Option<u8>,
    pub bytes: Option<u64>,
    pub packets: Option<u64>,
    pub first_uptime_ms: Option<u32>,
    pub last_uptime_ms: Option<u32>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

impl FlowFields {
    /// Record one field value. Unknown and vendor elements are ignored.
    pub fn apply(&mut self, spec: &FieldSpec, value: &[u8]) {
        if spec.enterprise.is_some() {
            return;
        }
        match spec.id {
            // Delta counters win over running totals when both are exported.
            OCTET_DELTA_COUNT => self.bytes = be_uint(value).or(self.bytes),
            OCTET_TOTAL_COUNT => self.bytes = self.bytes.or_else(|| be_uint(value)),
            PACKET_DELTA_COUNT => self.packets = be_uint(value).or(self.packets),
            PACKET_TOTAL_COUNT => self.packets = self.packets.or_else(|| be_uint(value)),
            PROTOCOL_IDENTIFIER => self.protocol = be_uint(value).map(|v| v as u8),
            SOURCE_TRANSPORT_PORT => self.src_port = be_uint(value).map(|v| v as u16),
            DESTINATION_TRANSPORT_PORT => self.dst_port = be_uint(value).map(|v| v as u16),
            SOURCE_IPV4_ADDRESS | SOURCE_IPV6_ADDRESS => {
                if let Some(ip) = ip_from(value) {
                    self.src_addr = Some(ip);
                }
            }
            DESTINATION_IPV4_ADDRESS | DESTINATION_IPV6_ADDRESS => {
                if let Some(ip) = ip_from(value) {
                    self.dst_addr = Some(ip);
                }
            }
            FIRST_SWITCHED => self.first_uptime_ms = be_uint(value).map(|v| v as u32),
            LAST_SWITCHED => self.last_uptime_ms = be_uint(value).map(|v| v as u32),
            FLOW_START_SECONDS => self.start_ms = be_uint(value).map(|s| s.saturating_mul(1000)),
            FLOW_END_SECONDS => self.end_ms = be_uint(value).map(|s| s.saturating_mul(1000)),
            FLOW_START_MILLISECONDS => self.start_ms = be_uint(value),
            FLOW_END_MILLISECONDS => self.end_ms = be_uint(value),
            _ => {}
        }
    }

    pub fn into_record(
        self,
        identifier: &str,
        protocol: ProtocolTag,
        timestamp: FlowTimestamp,
        clock: &ExportClock,
    ) -> FlowRecord {
        let mut builder = FlowRecord::builder(identifier, protocol).timestamp(timestamp);

        if let Some(addr) = self.src_addr {
            builder = builder.source(Endpoint::new(addr, self.src_port));
        }
        if let Some(addr) = self.dst_addr {
            builder = builder.destination(Endpoint::new(addr, self.dst_port));
        }
        if let Some(proto) = self.protocol {
            builder = builder.transport(proto);
        }
        if let Some(bytes) = self.bytes {
            builder = builder.byte_count(bytes);
        }
        if let Some(packets) = self.packets {
            builder = builder.packet_count(packets);
        }

        let start = self
            .start_ms
            .or_else(|| self.first_uptime_ms.and_then(|t| clock.resolve_uptime(t)));
        let end = self
            .end_ms
            .or_else(|| self.last_uptime_ms.and_then(|t| clock.resolve_uptime(t)));
        if let Some(start) = start {
            builder = builder.flow_start_ms(start);
        }
        if let Some(end) = end {
            builder = builder.flow_end_ms(end);
        }

        builder.build()
    }
}

/// Walk the data records of one set body.
///
/// Trailing bytes shorter than a minimal record are padding. Variable-length
/// fields are only legal when `allow_varlen` is set (IPFIX).
pub(crate) fn parse_data_records(
    body: &mut Reader<'_>,
    template: &Template,
    allow_varlen: bool,
) -> Result<Vec<FlowFields>, DecodeError> {
    let min = template.min_record_length();
    if min == 0 {
        return Err(DecodeError::Malformed("template describes empty records".into()));
    }

    let mut records = Vec::new();
    while body.remaining() >= min {
        let mut fields = FlowFields::default();
        for spec in &template.fields {
            let value = if spec.length == VARIABLE_LENGTH {
                if !allow_varlen {
                    return Err(DecodeError::Malformed(format!(
                        "variable-length field {} outside IPFIX",
                        spec.id
                    )));
                }
                let short = body.u8("variable-length prefix")?;
                let len = if short == 255 {
                    body.u16("variable-length prefix")?
                } else {
                    u16::from(short)
                };
                body.bytes(usize::from(len), "variable-length field")?
            } else {
                body.bytes(usize::from(spec.length), "data record")?
            };
            fields.apply(spec, value);
        }
        records.push(fields);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn spec(id: u16, length: u16) -> FieldSpec {
        FieldSpec {
            id,
            length,
            enterprise: None,
        }
    }

    fn exporter() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
    }

    #[test]
    fn data_records_are_walked_and_padding_ignored() {
        let template = Template {
            fields: vec![spec(8, 4), spec(12, 4), spec(4, 1), spec(1, 4)],
            options: false,
        };
        let mut bytes = Vec::new();
        for last in [1u8, 2] {
            bytes.extend_from_slice(&[10, 0, 0, last, 10, 0, 0, 9, 17, 0, 0, 1, 0]);
        }
        bytes.extend_from_slice(&[0, 0]); // padding

        let records = parse_data_records(&mut Reader::new(&bytes), &template, false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].src_addr, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        assert_eq!(records[0].protocol, Some(17));
        assert_eq!(records[0].bytes, Some(256));
        assert_eq!(records[0].packets, None);
    }

    #[test]
    fn variable_length_fields_need_ipfix() {
        let template = Template {
            fields: vec![spec(82, VARIABLE_LENGTH), spec(2, 4)],
            options: false,
        };
        let bytes = [3, b'e', b't', b'h', 0, 0, 0, 7];

        let records = parse_data_records(&mut Reader::new(&bytes), &template, true).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].packets, Some(7));

        assert!(parse_data_records(&mut Reader::new(&bytes), &template, false).is_err());
    }

    #[test]
    fn vendor_elements_are_ignored() {
        let mut fields = FlowFields::default();
        fields.apply(
            &FieldSpec {
                id: 1,
                length: 4,
                enterprise: Some(2636),
            },
            &[0, 0, 0, 9],
        );
        assert_eq!(fields.bytes, None);
    }

    #[test]
    fn uptime_is_resolved_against_export_time() {
        let clock = ExportClock {
            export_unix_ms: 1_000_000,
            sys_uptime_ms: Some(50_000),
        };
        assert_eq!(clock.resolve_uptime(45_000), Some(995_000));

        let fields = FlowFields {
            first_uptime_ms: Some(40_000),
            last_uptime_ms: Some(49_000),
            ..FlowFields::default()
        };
        let record = fields.into_record("nf", ProtocolTag::Netflow, FlowTimestamp::now(), &clock);
        assert_eq!(record.flow_start_ms(), Some(990_000));
        assert_eq!(record.flow_end_ms(), Some(999_000));
    }

    #[test]
    fn cache_evicts_oldest_when_full() {
        let mut cache = TemplateCache::with_capacity(2);
        let t = Template {
            fields: vec![spec(1, 4)],
            options: false,
        };
        cache.insert((exporter(), 0, 256), t.clone());
        cache.insert((exporter(), 0, 257), t.clone());
        cache.insert((exporter(), 0, 256), t.clone());
        cache.insert((exporter(), 0, 258), t);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&(exporter(), 0, 256)).is_none());
        assert!(cache.get(&(exporter(), 0, 258)).is_some());
    }

    #[test]
    fn domain_withdrawal_respects_kind() {
        let mut cache = TemplateCache::default();
        cache.insert((exporter(), 1, 256), Template { fields: vec![spec(1, 4)], options: false });
        cache.insert((exporter(), 1, 257), Template { fields: vec![spec(1, 4)], options: true });
        cache.insert((exporter(), 2, 256), Template { fields: vec![spec(1, 4)], options: false });

        cache.remove_domain(exporter(), 1, Some(false));
        assert!(cache.get(&(exporter(), 1, 256)).is_none());
        assert!(cache.get(&(exporter(), 1, 257)).is_some());
        assert!(cache.get(&(exporter(), 2, 256)).is_some());
    }
}
