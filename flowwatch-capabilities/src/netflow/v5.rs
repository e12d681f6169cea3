//! NetFlow v5: fixed 24-byte header followed by 48-byte records.

use std::net::IpAddr;

use flowwatch_core::{DecodeError, RawDatagram};
use flowwatch_types::{FlowRecord, FlowTimestamp, ProtocolTag};

use crate::template::{ExportClock, FlowFields};
use crate::wire::Reader;

pub(crate) const HEADER_LEN: usize = 24;
pub(crate) const RECORD_LEN: usize = 48;
/// Exporters never pack more than 30 records into one v5 datagram.
pub(crate) const MAX_RECORDS: u16 = 30;

pub(crate) fn decode(
    identifier: &str,
    protocol: ProtocolTag,
    datagram: &RawDatagram,
) -> Result<Vec<FlowRecord>, DecodeError> {
    let mut r = Reader::new(&datagram.payload);
    let _version = r.u16("netflow v5 header")?;
    let count = r.u16("netflow v5 header")?;
    let sys_uptime = r.u32("netflow v5 header")?;
    let unix_secs = r.u32("netflow v5 header")?;
    let unix_nsecs = r.u32("netflow v5 header")?;
    r.skip(HEADER_LEN - 16, "netflow v5 header")?;

    if count > MAX_RECORDS {
        return Err(DecodeError::Malformed(format!(
            "netflow v5 record count {count} exceeds {MAX_RECORDS}"
        )));
    }
    let needed = usize::from(count) * RECORD_LEN;
    if r.remaining() < needed {
        return Err(DecodeError::Truncated {
            context: "netflow v5 records",
            needed,
            available: r.remaining(),
        });
    }

    let clock = ExportClock {
        export_unix_ms: u64::from(unix_secs) * 1000 + u64::from(unix_nsecs) / 1_000_000,
        sys_uptime_ms: Some(sys_uptime),
    };
    let timestamp = FlowTimestamp::new(clock.export_unix_ms, datagram.received);

    let mut records = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let mut rec = r.sub(RECORD_LEN, "netflow v5 record")?;
        let src = rec.ipv4("srcaddr")?;
        let dst = rec.ipv4("dstaddr")?;
        rec.skip(4 + 2 + 2, "nexthop/ifindex")?;
        let packets = rec.u32("dPkts")?;
        let octets = rec.u32("dOctets")?;
        let first = rec.u32("First")?;
        let last = rec.u32("Last")?;
        let src_port = rec.u16("srcport")?;
        let dst_port = rec.u16("dstport")?;
        rec.skip(2, "pad1/tcp_flags")?;
        let proto = rec.u8("prot")?;

        let fields = FlowFields {
            src_addr: Some(IpAddr::V4(src)),
            dst_addr: Some(IpAddr::V4(dst)),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            protocol: Some(proto),
            bytes: Some(u64::from(octets)),
            packets: Some(u64::from(packets)),
            first_uptime_ms: Some(first),
            last_uptime_ms: Some(last),
            ..FlowFields::default()
        };
        records.push(fields.into_record(identifier, protocol, timestamp, &clock));
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    /// One v5 record: (src, dst, sport, dport, proto, packets, octets).
    pub(crate) type V5Flow = ([u8; 4], [u8; 4], u16, u16, u8, u32, u32);

    pub(crate) fn v5_datagram(flows: &[V5Flow]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&5u16.to_be_bytes());
        b.extend_from_slice(&(flows.len() as u16).to_be_bytes());
        b.extend_from_slice(&100_000u32.to_be_bytes()); // sys_uptime
        b.extend_from_slice(&1_703_160_000u32.to_be_bytes()); // unix_secs
        b.extend_from_slice(&250_000_000u32.to_be_bytes()); // unix_nsecs
        b.extend_from_slice(&[0u8; 8]); // sequence, engine, sampling
        for (src, dst, sport, dport, proto, pkts, octets) in flows {
            b.extend_from_slice(src);
            b.extend_from_slice(dst);
            b.extend_from_slice(&[0u8; 8]); // nexthop, input, output
            b.extend_from_slice(&pkts.to_be_bytes());
            b.extend_from_slice(&octets.to_be_bytes());
            b.extend_from_slice(&90_000u32.to_be_bytes()); // First
            b.extend_from_slice(&99_000u32.to_be_bytes()); // Last
            b.extend_from_slice(&sport.to_be_bytes());
            b.extend_from_slice(&dport.to_be_bytes());
            b.extend_from_slice(&[0, 0x18, *proto, 0]); // pad1, tcp_flags, prot, tos
            b.extend_from_slice(&[0u8; 8]); // as, masks, pad2
        }
        b
    }

    fn datagram(payload: Vec<u8>) -> RawDatagram {
        RawDatagram::now(SocketAddr::from(([192, 0, 2, 1], 2055)), payload)
    }

    #[test]
    fn decodes_records_and_export_time() {
        let payload = v5_datagram(&[
            ([10, 0, 0, 1], [10, 0, 0, 2], 1111, 443, 6, 10, 1500),
            ([10, 0, 0, 3], [10, 0, 0, 4], 53, 5353, 17, 1, 80),
        ]);
        let records = decode("netflow_udp", ProtocolTag::Netflow, &datagram(payload)).unwrap();

        assert_eq!(records.len(), 2);
        let r = &records[0];
        assert_eq!(r.raw_protocol_tag(), ProtocolTag::Netflow);
        assert_eq!(r.byte_count(), Some(1500));
        assert_eq!(r.packet_count(), Some(10));
        assert_eq!(r.latency_ms(), None);
        assert_eq!(r.timestamp().unix_ms, 1_703_160_000_250);
        assert_eq!(r.flow_start_ms(), Some(1_703_160_000_250 - 10_000));
        assert_eq!(r.flow_end_ms(), Some(1_703_160_000_250 - 1_000));
        assert_eq!(r.flow_key().as_deref(), Some("10.0.0.1:1111->10.0.0.2:443/TCP"));
        assert_eq!(
            records[1].destination_address().map(|e| e.address),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)))
        );
    }

    #[test]
    fn zero_counters_stay_zero() {
        let payload = v5_datagram(&[([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 17, 0, 0)]);
        let records = decode("nf", ProtocolTag::Netflow, &datagram(payload)).unwrap();
        assert_eq!(records[0].byte_count(), Some(0));
        assert_eq!(records[0].packet_count(), Some(0));
    }

    #[test]
    fn truncated_record_area_is_an_error() {
        let mut payload = v5_datagram(&[([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 6, 1, 1)]);
        payload.truncate(HEADER_LEN + 20);
        let err = decode("nf", ProtocolTag::Netflow, &datagram(payload)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated { context: "netflow v5 records", needed: 48, available: 20 }
        ));
    }

    #[test]
    fn short_header_is_an_error() {
        let err = decode("nf", ProtocolTag::Netflow, &datagram(vec![0, 5, 0, 1])).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn absurd_count_is_rejected() {
        let mut payload = v5_datagram(&[]);
        payload[2..4].copy_from_slice(&200u16.to_be_bytes());
        assert!(matches!(
            decode("nf", ProtocolTag::Netflow, &datagram(payload)),
            Err(DecodeError::Malformed(_))
        ));
    }
}
