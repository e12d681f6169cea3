//! IPFIX (RFC 7011) over UDP.

use flowwatch_core::{Capability, DecodeError, Decoder, LoadError, RawDatagram};
use flowwatch_types::{FlowRecord, FlowTimestamp, ProtocolTag};
use tracing::debug;

use crate::template::{parse_data_records, ExportClock, FieldSpec, Template, TemplateCache};
use crate::udp::UdpCapability;
use crate::wire::Reader;

pub const IDENTIFIER: &str = "ipfix_udp";
pub const DEFAULT_BIND: &str = "0.0.0.0:4739";

pub(crate) const VERSION: u16 = 10;
const HEADER_LEN: usize = 16;
const TEMPLATE_SET: u16 = 2;
const OPTIONS_TEMPLATE_SET: u16 = 3;
const MIN_DATA_SET: u16 = 256;
const ENTERPRISE_BIT: u16 = 0x8000;

/// Build the IPFIX capability under `identifier`.
pub fn load(identifier: &str) -> Result<Box<dyn Capability>, LoadError> {
    Ok(Box::new(UdpCapability::new(
        identifier,
        ProtocolTag::Ipfix,
        DEFAULT_BIND,
        |id: &str| Box::new(IpfixDecoder::new(id, ProtocolTag::Ipfix)) as Box<dyn Decoder>,
    )))
}

/// Decodes IPFIX messages, caching templates per observation domain.
#[derive(Debug)]
pub struct IpfixDecoder {
    identifier: String,
    protocol: ProtocolTag,
    templates: TemplateCache,
}

impl IpfixDecoder {
    pub fn new(identifier: impl Into<String>, protocol: ProtocolTag) -> Self {
        Self {
            identifier: identifier.into(),
            protocol,
            templates: TemplateCache::default(),
        }
    }
}

impl Decoder for IpfixDecoder {
    fn decode(&mut self, datagram: &RawDatagram) -> Result<Vec<FlowRecord>, DecodeError> {
        let mut outer = Reader::new(&datagram.payload);
        let version = outer.u16("ipfix header")?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion {
                protocol: "ipfix",
                version: u32::from(version),
            });
        }
        let length = usize::from(outer.u16("ipfix header")?);
        if length < HEADER_LEN {
            return Err(DecodeError::Malformed(format!(
                "ipfix message length {length} shorter than its header"
            )));
        }
        // The message length bounds everything after the version/length pair.
        let mut r = outer.sub(length - 4, "ipfix message")?;
        let export_time = r.u32("ipfix header")?;
        let _sequence = r.u32("ipfix header")?;
        let domain = r.u32("ipfix header")?;

        let exporter = datagram.peer.ip();
        let clock = ExportClock {
            export_unix_ms: u64::from(export_time) * 1000,
            sys_uptime_ms: None,
        };
        let timestamp = FlowTimestamp::new(clock.export_unix_ms, datagram.received);

        let mut records = Vec::new();
        while r.remaining() >= 4 {
            let set_start = HEADER_LEN + r.position();
            let set_id = r.u16("set header")?;
            let set_len = usize::from(r.u16("set header")?);
            if set_len < 4 {
                return Err(DecodeError::Malformed(format!(
                    "set {set_id} at offset {set_start} has length {set_len}"
                )));
            }
            let mut body = r.sub(set_len - 4, "set body")?;

            match set_id {
                TEMPLATE_SET | OPTIONS_TEMPLATE_SET => {
                    let options = set_id == OPTIONS_TEMPLATE_SET;
                    while body.remaining() >= 4 {
                        read_template(&mut body, options, &mut self.templates, exporter, domain)?;
                    }
                }
                id if id >= MIN_DATA_SET => {
                    let Some(template) = self.templates.get(&(exporter, domain, id)) else {
                        debug!(exporter = %exporter, domain, template_id = id, "data set before its template, skipped");
                        continue;
                    };
                    if template.options {
                        continue;
                    }
                    for fields in parse_data_records(&mut body, template, true)? {
                        records.push(fields.into_record(
                            &self.identifier,
                            self.protocol,
                            timestamp,
                            &clock,
                        ));
                    }
                }
                reserved => debug!(set_id = reserved, "reserved set skipped"),
            }
        }

        debug!(exporter = %exporter, domain, templates = self.templates.len(), records = records.len(), "ipfix message decoded");
        Ok(records)
    }
}

/// Read one (options) template record, or apply a withdrawal.
fn read_template(
    body: &mut Reader<'_>,
    options: bool,
    templates: &mut TemplateCache,
    exporter: std::net::IpAddr,
    domain: u32,
) -> Result<(), DecodeError> {
    let template_id = body.u16("template record")?;
    let field_count = body.u16("template record")?;

    if field_count == 0 {
        if template_id == TEMPLATE_SET || template_id == OPTIONS_TEMPLATE_SET {
            templates.remove_domain(exporter, domain, Some(options));
        } else {
            templates.remove(&(exporter, domain, template_id));
        }
        debug!(exporter = %exporter, domain, template_id, "template withdrawn");
        return Ok(());
    }
    if template_id < MIN_DATA_SET {
        return Err(DecodeError::Malformed(format!("template id {template_id} is reserved")));
    }
    if options {
        let _scope_count = body.u16("options template record")?;
    }

    let mut fields = Vec::with_capacity(usize::from(field_count));
    for _ in 0..field_count {
        let raw_id = body.u16("field specifier")?;
        let length = body.u16("field specifier")?;
        let enterprise = if raw_id & ENTERPRISE_BIT != 0 {
            Some(body.u32("enterprise number")?)
        } else {
            None
        };
        fields.push(FieldSpec {
            id: raw_id & !ENTERPRISE_BIT,
            length,
            enterprise,
        });
    }
    templates.insert((exporter, domain, template_id), Template { fields, options });
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv6Addr, SocketAddr};

    pub(crate) fn message(export_time: u32, domain: u32, sets: &[Vec<u8>]) -> Vec<u8> {
        let body_len: usize = sets.iter().map(Vec::len).sum();
        let mut b = Vec::new();
        b.extend_from_slice(&VERSION.to_be_bytes());
        b.extend_from_slice(&((HEADER_LEN + body_len) as u16).to_be_bytes());
        b.extend_from_slice(&export_time.to_be_bytes());
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(&domain.to_be_bytes());
        for set in sets {
            b.extend_from_slice(set);
        }
        b
    }

    pub(crate) fn set(id: u16, body: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&id.to_be_bytes());
        b.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        b.extend_from_slice(body);
        b
    }

    /// Template 256: src v4, dst v4, src port, dst port, proto, octets(8), packets(8), start ms, end ms.
    pub(crate) fn v4_template() -> Vec<u8> {
        let fields: [(u16, u16); 9] =
            [(8, 4), (12, 4), (7, 2), (11, 2), (4, 1), (1, 8), (2, 8), (152, 8), (153, 8)];
        let mut body = Vec::new();
        body.extend_from_slice(&256u16.to_be_bytes());
        body.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (id, len) in fields {
            body.extend_from_slice(&id.to_be_bytes());
            body.extend_from_slice(&len.to_be_bytes());
        }
        set(TEMPLATE_SET, &body)
    }

    pub(crate) fn v4_data(octets: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[172, 16, 0, 1]);
        body.extend_from_slice(&[172, 16, 0, 2]);
        body.extend_from_slice(&40000u16.to_be_bytes());
        body.extend_from_slice(&443u16.to_be_bytes());
        body.push(6);
        body.extend_from_slice(&octets.to_be_bytes());
        body.extend_from_slice(&12u64.to_be_bytes());
        body.extend_from_slice(&1_703_159_990_000u64.to_be_bytes());
        body.extend_from_slice(&1_703_159_999_500u64.to_be_bytes());
        set(256, &body)
    }

    fn datagram(payload: Vec<u8>) -> RawDatagram {
        RawDatagram::now(SocketAddr::from(([198, 51, 100, 7], 4739)), payload)
    }

    fn decoder() -> IpfixDecoder {
        IpfixDecoder::new(IDENTIFIER, ProtocolTag::Ipfix)
    }

    #[test]
    fn decodes_template_and_data() {
        let payload = message(1_703_160_000, 5, &[v4_template(), v4_data(9000)]);
        let records = decoder().decode(&datagram(payload)).unwrap();

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.raw_protocol_tag(), ProtocolTag::Ipfix);
        assert_eq!(r.byte_count(), Some(9000));
        assert_eq!(r.packet_count(), Some(12));
        assert_eq!(r.timestamp().unix_ms, 1_703_160_000_000);
        assert_eq!(r.flow_start_ms(), Some(1_703_159_990_000));
        assert_eq!(r.flow_end_ms(), Some(1_703_159_999_500));
        assert_eq!(r.flow_key().as_deref(), Some("172.16.0.1:40000->172.16.0.2:443/TCP"));
    }

    #[test]
    fn ipv6_and_enterprise_fields() {
        // Template 300: enterprise field (PEN 2636, id 1, len 4), src v6, dst v6, packets(4)
        let mut body = Vec::new();
        body.extend_from_slice(&300u16.to_be_bytes());
        body.extend_from_slice(&4u16.to_be_bytes());
        body.extend_from_slice(&(1u16 | ENTERPRISE_BIT).to_be_bytes());
        body.extend_from_slice(&4u16.to_be_bytes());
        body.extend_from_slice(&2636u32.to_be_bytes());
        body.extend_from_slice(&[0, 27, 0, 16, 0, 28, 0, 16, 0, 2, 0, 4]);
        let template = set(TEMPLATE_SET, &body);

        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 99]);
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        data.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        data.extend_from_slice(&[0, 0, 0, 4]);
        let data = set(300, &data);

        let records = decoder()
            .decode(&datagram(message(1, 1, &[template, data])))
            .unwrap();
        let r = &records[0];
        assert_eq!(r.byte_count(), None);
        assert_eq!(r.packet_count(), Some(4));
        assert_eq!(
            r.source_address().map(|e| e.address),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(r.source_address().and_then(|e| e.port), None);
    }

    #[test]
    fn withdrawal_forgets_template() {
        let mut d = decoder();
        d.decode(&datagram(message(1, 5, &[v4_template()]))).unwrap();
        assert_eq!(d.decode(&datagram(message(1, 5, &[v4_data(1)]))).unwrap().len(), 1);

        let withdraw = set(TEMPLATE_SET, &[1, 0, 0, 0]);
        d.decode(&datagram(message(1, 5, &[withdraw]))).unwrap();
        assert!(d.decode(&datagram(message(1, 5, &[v4_data(1)]))).unwrap().is_empty());
    }

    #[test]
    fn options_template_data_is_not_a_flow() {
        let mut body = Vec::new();
        body.extend_from_slice(&400u16.to_be_bytes());
        body.extend_from_slice(&2u16.to_be_bytes()); // field count
        body.extend_from_slice(&1u16.to_be_bytes()); // scope count
        body.extend_from_slice(&[0, 149, 0, 4, 0, 41, 0, 8]);
        let template = set(OPTIONS_TEMPLATE_SET, &body);
        let data = set(400, &[0; 12]);

        let records = decoder()
            .decode(&datagram(message(1, 1, &[template, data])))
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn wrong_version_and_lengths_are_errors() {
        let mut payload = message(1, 1, &[]);
        payload[1] = 9;
        assert!(matches!(
            decoder().decode(&datagram(payload)),
            Err(DecodeError::UnsupportedVersion { protocol: "ipfix", version: 9 })
        ));

        let mut payload = message(1, 1, &[v4_template()]);
        payload.truncate(30);
        assert!(matches!(
            decoder().decode(&datagram(payload)),
            Err(DecodeError::Truncated { context: "ipfix message", .. })
        ));

        let payload = message(1, 1, &[vec![0, 2, 0, 1]]);
        assert!(matches!(decoder().decode(&datagram(payload)), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn varlen_fields_are_decoded() {
        let mut body = Vec::new();
        body.extend_from_slice(&500u16.to_be_bytes());
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0, 82, 0xFF, 0xFF, 0, 2, 0, 4]);
        let template = set(TEMPLATE_SET, &body);
        let data = set(500, &[4, b'e', b't', b'h', b'0', 0, 0, 0, 5]);

        let records = decoder()
            .decode(&datagram(message(1, 1, &[template, data])))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].packet_count(), Some(5));
    }
}
