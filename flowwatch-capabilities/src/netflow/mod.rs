//! NetFlow v5 and v9 collection.
//!
//! The version field at the start of each datagram selects the parser. v9
//! templates live in the decoder, so they are forgotten when the capability
//! stops and must be re-announced by the exporter.

mod v5;
mod v9;

use flowwatch_core::{Capability, DecodeError, Decoder, LoadError, RawDatagram};
use flowwatch_types::{FlowRecord, ProtocolTag};

use crate::template::TemplateCache;
use crate::udp::UdpCapability;
use crate::wire::Reader;

pub const IDENTIFIER: &str = "netflow_udp";
pub const DEFAULT_BIND: &str = "0.0.0.0:2055";

/// Build the NetFlow capability under `identifier`.
pub fn load(identifier: &str) -> Result<Box<dyn Capability>, LoadError> {
    Ok(Box::new(UdpCapability::new(
        identifier,
        ProtocolTag::Netflow,
        DEFAULT_BIND,
        |id: &str| Box::new(NetflowDecoder::new(id, ProtocolTag::Netflow)) as Box<dyn Decoder>,
    )))
}

/// Decodes NetFlow v5 and v9 datagrams.
#[derive(Debug)]
pub struct NetflowDecoder {
    identifier: String,
    protocol: ProtocolTag,
    templates: TemplateCache,
}

impl NetflowDecoder {
    /// `protocol` is the tag stamped on records; jFlow reuses this decoder.
    pub fn new(identifier: impl Into<String>, protocol: ProtocolTag) -> Self {
        Self {
            identifier: identifier.into(),
            protocol,
            templates: TemplateCache::default(),
        }
    }

    pub(crate) fn version(payload: &[u8]) -> Result<u16, DecodeError> {
        Reader::new(payload).u16("flow export version")
    }
}

impl Decoder for NetflowDecoder {
    fn decode(&mut self, datagram: &RawDatagram) -> Result<Vec<FlowRecord>, DecodeError> {
        match Self::version(&datagram.payload)? {
            5 => v5::decode(&self.identifier, self.protocol, datagram),
            9 => v9::decode(&self.identifier, self.protocol, &mut self.templates, datagram),
            version => Err(DecodeError::UnsupportedVersion {
                protocol: "netflow",
                version: u32::from(version),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::SocketAddr;

    pub(crate) use super::v5::tests::v5_datagram;
    pub(crate) use super::v9::tests::{data_flowset, header as v9_header, template_flowset};

    fn datagram(payload: Vec<u8>) -> RawDatagram {
        RawDatagram::now(SocketAddr::from(([192, 0, 2, 1], 2055)), payload)
    }

    #[test]
    fn dispatches_on_version() {
        let mut decoder = NetflowDecoder::new(IDENTIFIER, ProtocolTag::Netflow);

        let v5 = v5_datagram(&[([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 6, 1, 1)]);
        assert_eq!(decoder.decode(&datagram(v5)).unwrap().len(), 1);

        let mut v9 = v9_header(1, 1, 1);
        v9.extend(template_flowset());
        v9.extend(data_flowset(10));
        assert_eq!(decoder.decode(&datagram(v9)).unwrap().len(), 1);
    }

    #[test]
    fn unknown_version_is_unsupported() {
        let mut decoder = NetflowDecoder::new(IDENTIFIER, ProtocolTag::Netflow);
        let err = decoder.decode(&datagram(vec![0, 7, 0, 0])).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnsupportedVersion { protocol: "netflow", version: 7 }
        ));
    }

    #[test]
    fn empty_datagram_is_truncated() {
        let mut decoder = NetflowDecoder::new(IDENTIFIER, ProtocolTag::Netflow);
        assert!(matches!(
            decoder.decode(&datagram(Vec::new())),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn fresh_decoder_has_no_templates() {
        let cap = load(IDENTIFIER).unwrap();
        let mut first = cap.decoder();
        let mut payload = v9_header(1, 1, 1);
        payload.extend(template_flowset());
        first.decode(&datagram(payload)).unwrap();

        let mut second = cap.decoder();
        let mut data = v9_header(1, 1, 1);
        data.extend(data_flowset(1));
        assert!(second.decode(&datagram(data)).unwrap().is_empty());
    }
}
