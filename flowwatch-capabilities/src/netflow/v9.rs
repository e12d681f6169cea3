//! NetFlow v9: template-driven flowsets (RFC 3954).

use flowwatch_core::{DecodeError, RawDatagram};
use flowwatch_types::{FlowRecord, FlowTimestamp, ProtocolTag};
use tracing::debug;

use crate::template::{parse_data_records, ExportClock, FieldSpec, Template, TemplateCache};
use crate::wire::Reader;

pub(crate) const HEADER_LEN: usize = 20;
const TEMPLATE_FLOWSET: u16 = 0;
const OPTIONS_TEMPLATE_FLOWSET: u16 = 1;
/// Flowset ids above this carry data.
const MIN_DATA_FLOWSET: u16 = 256;

pub(crate) fn decode(
    identifier: &str,
    protocol: ProtocolTag,
    templates: &mut TemplateCache,
    datagram: &RawDatagram,
) -> Result<Vec<FlowRecord>, DecodeError> {
    let mut r = Reader::new(&datagram.payload);
    let _version = r.u16("netflow v9 header")?;
    let _count = r.u16("netflow v9 header")?;
    let sys_uptime = r.u32("netflow v9 header")?;
    let unix_secs = r.u32("netflow v9 header")?;
    let _sequence = r.u32("netflow v9 header")?;
    let source_id = r.u32("netflow v9 header")?;

    let exporter = datagram.peer.ip();
    let clock = ExportClock {
        export_unix_ms: u64::from(unix_secs) * 1000,
        sys_uptime_ms: Some(sys_uptime),
    };
    let timestamp = FlowTimestamp::new(clock.export_unix_ms, datagram.received);

    let mut records = Vec::new();
    while r.remaining() >= 4 {
        let flowset_id = r.u16("flowset header")?;
        let length = usize::from(r.u16("flowset header")?);
        if length < 4 {
            return Err(DecodeError::Malformed(format!(
                "flowset {flowset_id} length {length} shorter than its header"
            )));
        }
        let mut body = r.sub(length - 4, "flowset body")?;

        match flowset_id {
            TEMPLATE_FLOWSET => {
                while body.remaining() >= 4 {
                    let template_id = body.u16("template header")?;
                    let field_count = body.u16("template header")?;
                    let fields = read_fields(&mut body, usize::from(field_count))?;
                    templates.insert(
                        (exporter, source_id, template_id),
                        Template {
                            fields,
                            options: false,
                        },
                    );
                }
            }
            OPTIONS_TEMPLATE_FLOWSET => {
                while body.remaining() >= 6 {
                    let template_id = body.u16("options template header")?;
                    let scope_len = usize::from(body.u16("options template header")?);
                    let option_len = usize::from(body.u16("options template header")?);
                    if scope_len % 4 != 0 || option_len % 4 != 0 {
                        return Err(DecodeError::Malformed(
                            "options template lengths are not field-aligned".into(),
                        ));
                    }
                    let fields = read_fields(&mut body, (scope_len + option_len) / 4)?;
                    templates.insert(
                        (exporter, source_id, template_id),
                        Template {
                            fields,
                            options: true,
                        },
                    );
                }
            }
            id if id >= MIN_DATA_FLOWSET => {
                let Some(template) = templates.get(&(exporter, source_id, id)) else {
                    debug!(exporter = %exporter, source_id, template_id = id, "data flowset before its template, skipped");
                    continue;
                };
                if template.options {
                    continue;
                }
                for fields in parse_data_records(&mut body, template, false)? {
                    records.push(fields.into_record(identifier, protocol, timestamp, &clock));
                }
            }
            reserved => {
                debug!(flowset_id = reserved, "reserved flowset skipped");
            }
        }
    }

    debug!(exporter = %exporter, templates = templates.len(), records = records.len(), "netflow v9 datagram decoded");
    Ok(records)
}

fn read_fields(body: &mut Reader<'_>, count: usize) -> Result<Vec<FieldSpec>, DecodeError> {
    (0..count)
        .map(|_| {
            Ok(FieldSpec {
                id: body.u16("template field")?,
                length: body.u16("template field")?,
                enterprise: None,
            })
        })
        .collect()
}
