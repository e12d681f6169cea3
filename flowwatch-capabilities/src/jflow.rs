//! Juniper jFlow over UDP.
//!
//! jFlow exporters speak NetFlow v5, v9 or IPFIX on the wire. Records are
//! decoded by the matching parser and tagged as jFlow.

use flowwatch_core::{Capability, DecodeError, Decoder, LoadError, RawDatagram};
use flowwatch_types::{FlowRecord, ProtocolTag};

use crate::ipfix::{self, IpfixDecoder};
use crate::netflow::NetflowDecoder;
use crate::udp::UdpCapability;

pub const IDENTIFIER: &str = "jflow_udp";
pub const DEFAULT_BIND: &str = "0.0.0.0:9996";

/// Build the jFlow capability under `identifier`.
pub fn load(identifier: &str) -> Result<Box<dyn Capability>, LoadError> {
    Ok(Box::new(UdpCapability::new(
        identifier,
        ProtocolTag::Jflow,
        DEFAULT_BIND,
        |id: &str| Box::new(JflowDecoder::new(id)) as Box<dyn Decoder>,
    )))
}

#[derive(Debug)]
pub struct JflowDecoder {
    netflow: NetflowDecoder,
    ipfix: IpfixDecoder,
}

impl JflowDecoder {
    pub fn new(identifier: &str) -> Self {
        Self {
            netflow: NetflowDecoder::new(identifier, ProtocolTag::Jflow),
            ipfix: IpfixDecoder::new(identifier, ProtocolTag::Jflow),
        }
    }
}

impl Decoder for JflowDecoder {
    fn decode(&mut self, datagram: &RawDatagram) -> Result<Vec<FlowRecord>, DecodeError> {
        match NetflowDecoder::version(&datagram.payload)? {
            5 | 9 => self.netflow.decode(datagram),
            ipfix::VERSION => self.ipfix.decode(datagram),
            version => Err(DecodeError::UnsupportedVersion {
                protocol: "jflow",
                version: u32::from(version),
            }),
        }
    }
}
