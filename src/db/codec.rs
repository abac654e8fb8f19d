//! Binary primitives of the persisted database format
//!
//! Integers are little-endian except ports, which are big-endian as on the
//! wire. Lengths and counts use the CompactSize varint encoding.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::types::{Endpoint, NetAddr};

/// Largest count or length accepted while decoding
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Longest client sub-version string kept
pub const MAX_SUBVERSION_LENGTH: usize = 256;

/// Extended address network identifiers
const ADDRV2_NET_IPV4: u8 = 0x01;
const ADDRV2_NET_IPV6: u8 = 0x02;
const ADDRV2_NET_TORV3: u8 = 0x04;

/// Prefix of IPv4-mapped addresses in the legacy 16 byte format
const IPV4_IN_IPV6_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// Address encoding used for endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFormat {
    /// 16 byte IPv6 (IPv4-mapped for IPv4) followed by the port
    Legacy,
    /// Network id, length-prefixed address bytes, then the port
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of data: needed {needed} bytes at offset {offset}")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported network id {0}")]
    UnsupportedNetwork(u8),

    #[error("invalid address length {len} for network id {network}")]
    InvalidAddressLength { network: u8, len: u64 },

    #[error("size {0} exceeds limit")]
    OversizedLength(u64),

    #[error("non-canonical compact size encoding")]
    NonCanonicalCompactSize,

    #[error("address {0} cannot be written in the legacy format")]
    NotLegacyEncodable(Endpoint),

    #[error("{0} trailing bytes after database")]
    TrailingBytes(usize),
}

// =============================================================================
// READER
// =============================================================================

/// Cursor over an in-memory encoded buffer
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof { offset: self.pos, needed: n });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.read_bytes(N)?);
        Ok(arr)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_compact_size(&mut self) -> Result<u64, CodecError> {
        let first = self.read_u8()?;
        let value = match first {
            0..=0xfc => first as u64,
            0xfd => {
                let v = u16::from_le_bytes(self.read_array()?) as u64;
                if v < 0xfd {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            0xfe => {
                let v = u32::from_le_bytes(self.read_array()?) as u64;
                if v <= 0xffff {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            0xff => {
                let v = u64::from_le_bytes(self.read_array()?);
                if v <= 0xffff_ffff {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
        };
        if value > MAX_SIZE {
            return Err(CodecError::OversizedLength(value));
        }
        Ok(value)
    }

    /// Length-prefixed string; invalid UTF-8 is replaced rather than rejected
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_compact_size()?;
        if len as usize > MAX_SUBVERSION_LENGTH {
            return Err(CodecError::OversizedLength(len));
        }
        let bytes = self.read_bytes(len as usize)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_endpoint(&mut self, format: AddrFormat) -> Result<Endpoint, CodecError> {
        let addr = match format {
            AddrFormat::Legacy => {
                let raw: [u8; 16] = self.read_array()?;
                if raw[..12] == IPV4_IN_IPV6_PREFIX {
                    NetAddr::Ipv4(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]))
                } else {
                    NetAddr::Ipv6(Ipv6Addr::from(raw))
                }
            }
            AddrFormat::V2 => {
                let network = self.read_u8()?;
                let len = self.read_compact_size()?;
                let expected = match network {
                    ADDRV2_NET_IPV4 => 4,
                    ADDRV2_NET_IPV6 => 16,
                    ADDRV2_NET_TORV3 => 32,
                    other => return Err(CodecError::UnsupportedNetwork(other)),
                };
                if len != expected {
                    return Err(CodecError::InvalidAddressLength { network, len });
                }
                match network {
                    ADDRV2_NET_IPV4 => NetAddr::Ipv4(Ipv4Addr::from(self.read_array::<4>()?)),
                    ADDRV2_NET_IPV6 => NetAddr::from_ip(Ipv6Addr::from(self.read_array::<16>()?).into()),
                    _ => NetAddr::TorV3(self.read_array::<32>()?),
                }
            }
        };
        let port = u16::from_be_bytes(self.read_array()?);
        Ok(Endpoint::new(addr, port))
    }
}

// =============================================================================
// WRITER
// =============================================================================

/// Growable output buffer
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_compact_size(&mut self, v: u64) {
        match v {
            0..=0xfc => self.write_u8(v as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.write_bytes(&(v as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_bytes(&(v as u32).to_le_bytes());
            }
            _ => {
                self.write_u8(0xff);
                self.write_bytes(&v.to_le_bytes());
            }
        }
    }

    /// Strings longer than the decoder accepts are truncated
    pub fn write_string(&mut self, s: &str) {
        let mut end = s.len().min(MAX_SUBVERSION_LENGTH);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.write_compact_size(end as u64);
        self.write_bytes(&s.as_bytes()[..end]);
    }

    pub fn write_endpoint(&mut self, endpoint: &Endpoint, format: AddrFormat) -> Result<(), CodecError> {
        match (format, endpoint.addr) {
            (AddrFormat::Legacy, NetAddr::Ipv4(ip)) => {
                self.write_bytes(&IPV4_IN_IPV6_PREFIX);
                self.write_bytes(&ip.octets());
            }
            (AddrFormat::Legacy, NetAddr::Ipv6(ip)) => self.write_bytes(&ip.octets()),
            (AddrFormat::Legacy, NetAddr::TorV3(_)) => {
                return Err(CodecError::NotLegacyEncodable(*endpoint));
            }
            (AddrFormat::V2, NetAddr::Ipv4(ip)) => {
                self.write_u8(ADDRV2_NET_IPV4);
                self.write_compact_size(4);
                self.write_bytes(&ip.octets());
            }
            (AddrFormat::V2, NetAddr::Ipv6(ip)) => {
                self.write_u8(ADDRV2_NET_IPV6);
                self.write_compact_size(16);
                self.write_bytes(&ip.octets());
            }
            (AddrFormat::V2, NetAddr::TorV3(key)) => {
                self.write_u8(ADDRV2_NET_TORV3);
                self.write_compact_size(32);
                self.write_bytes(&key);
            }
        }
        self.write_bytes(&endpoint.port.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_size_boundaries() {
        for (value, len) in [(0u64, 1usize), (0xfc, 1), (0xfd, 3), (0xffff, 3), (0x1_0000, 5)] {
            let mut w = Writer::new();
            w.write_compact_size(value);
            let bytes = w.into_inner();
            assert_eq!(bytes.len(), len, "encoded length of {:#x}", value);

            let mut r = Reader::new(&bytes);
            assert_eq!(r.read_compact_size().unwrap(), value);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn test_compact_size_rejects_non_canonical() {
        let bytes = [0xfd, 0x10, 0x00];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_compact_size(), Err(CodecError::NonCanonicalCompactSize));
    }

    #[test]
    fn test_compact_size_rejects_oversized() {
        let mut w = Writer::new();
        w.write_compact_size(MAX_SIZE + 1);
        let bytes = w.into_inner();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_compact_size(), Err(CodecError::OversizedLength(MAX_SIZE + 1)));
    }

    #[test]
    fn test_truncated_read() {
        let bytes = [1u8, 2, 3];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            r.read_i64(),
            Err(CodecError::UnexpectedEof { offset: 0, needed: 8 })
        );
    }

    #[test]
    fn test_legacy_ipv4_layout() {
        let endpoint = Endpoint::new(NetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), 8333);
        let mut w = Writer::new();
        w.write_endpoint(&endpoint, AddrFormat::Legacy).unwrap();
        let bytes = w.into_inner();

        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[10..12], &[0xff, 0xff]);
        assert_eq!(&bytes[12..16], &[1, 2, 3, 4]);
        // Port is big-endian
        assert_eq!(&bytes[16..18], &[0x20, 0x8d]);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_endpoint(AddrFormat::Legacy).unwrap(), endpoint);
    }

    #[test]
    fn test_v2_torv3_endpoint() {
        let endpoint = Endpoint::new(NetAddr::TorV3([7u8; 32]), 8333);
        let mut w = Writer::new();
        w.write_endpoint(&endpoint, AddrFormat::V2).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes[0], ADDRV2_NET_TORV3);
        assert_eq!(bytes.len(), 1 + 1 + 32 + 2);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_endpoint(AddrFormat::V2).unwrap(), endpoint);

        let mut w = Writer::new();
        assert!(matches!(
            w.write_endpoint(&endpoint, AddrFormat::Legacy),
            Err(CodecError::NotLegacyEncodable(_))
        ));
    }

    #[test]
    fn test_v2_rejects_bad_length() {
        let bytes = [ADDRV2_NET_IPV4, 5, 1, 2, 3, 4, 5, 0, 0];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            r.read_endpoint(AddrFormat::V2),
            Err(CodecError::InvalidAddressLength { network: ADDRV2_NET_IPV4, len: 5 })
        );

        let bytes = [0x05, 32];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_endpoint(AddrFormat::V2), Err(CodecError::UnsupportedNetwork(5)));
    }

    #[test]
    fn test_string_truncation() {
        let long = "x".repeat(MAX_SUBVERSION_LENGTH + 10);
        let mut w = Writer::new();
        w.write_string(&long);
        let bytes = w.into_inner();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string().unwrap().len(), MAX_SUBVERSION_LENGTH);
    }
}
