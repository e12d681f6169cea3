//! Big-endian byte cursor shared by the binary decoders.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use flowwatch_core::DecodeError;

/// Bounds-checked reader over a network-order buffer.
///
/// Every read names the structure being parsed so a short buffer turns into
/// a [`DecodeError::Truncated`] that says what was cut off.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                context,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize, context: &'static str) -> Result<(), DecodeError> {
        self.bytes(n, context).map(|_| ())
    }

    /// Split off the next `n` bytes as their own reader.
    pub fn sub(&mut self, n: usize, context: &'static str) -> Result<Reader<'a>, DecodeError> {
        self.bytes(n, context).map(Reader::new)
    }

    pub fn u8(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        Ok(self.bytes(1, context)?[0])
    }

    pub fn u16(&mut self, context: &'static str) -> Result<u16, DecodeError> {
        let b = self.bytes(2, context)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        let b = self.bytes(4, context)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn ipv4(&mut self, context: &'static str) -> Result<Ipv4Addr, DecodeError> {
        let b = self.bytes(4, context)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    pub fn ipv6(&mut self, context: &'static str) -> Result<Ipv6Addr, DecodeError> {
        Ok(ipv6_from(self.bytes(16, context)?))
    }
}

/// Unsigned big-endian integer of 1 to 8 bytes, as used by template fields.
pub(crate) fn be_uint(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

pub(crate) fn ipv6_from(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    Ipv6Addr::from(octets)
}

/// Address from a 4 or 16 byte field.
pub(crate) fn ip_from(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        16 => Some(IpAddr::V6(ipv6_from(bytes))),
        _ => None,
    }
}
