//! Wire format of voice datagrams
//!
//! One datagram carries exactly one encoded 10 ms frame. The payload may be
//! prefixed by a small header whose layout is fixed by [`HeaderFormat`];
//! both ends of a call must be configured with the same format.
//!
//! ```text
//! Bare:      [opus payload ...]
//! Sequence:  [seq: u32 BE][opus payload ...]
//! Timestamp: [ms since 2010-01-01 UTC: i64 BE][opus payload ...]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// One codec frame's worth of compressed audio, header included.
///
/// Immutable once created; cloning only bumps a reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    data: Bytes,
}

impl EncodedPacket {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Raw bytes as carried by the datagram
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Bytes> for EncodedPacket {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for EncodedPacket {
    fn from(data: Vec<u8>) -> Self {
        Self::new(Bytes::from(data))
    }
}

/// Layout of the header preceding every payload.
///
/// The layout itself carries no marker, so both ends must be configured with
/// the same format. Each format has a fixed version number (see
/// [`HeaderFormat::version`]) that names it in configuration and tooling;
/// a new layout gets a new number, existing numbers never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFormat {
    /// No header, the datagram is the codec payload
    #[default]
    Bare,
    /// 32-bit big-endian sequence number
    Sequence,
    /// 64-bit big-endian capture time, milliseconds since [`HEADER_EPOCH_UNIX_MS`]
    Timestamp,
}

impl HeaderFormat {
    /// Version number of this layout
    pub fn version(self) -> u8 {
        match self {
            HeaderFormat::Bare => 0,
            HeaderFormat::Sequence => 1,
            HeaderFormat::Timestamp => 2,
        }
    }

    pub fn from_version(version: u8) -> Option<Self> {
        match version {
            0 => Some(HeaderFormat::Bare),
            1 => Some(HeaderFormat::Sequence),
            2 => Some(HeaderFormat::Timestamp),
            _ => None,
        }
    }
}

impl std::str::FromStr for HeaderFormat {
    type Err = String;

    /// Accepts a format name or its version number
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bare" => Ok(HeaderFormat::Bare),
            "sequence" => Ok(HeaderFormat::Sequence),
            "timestamp" => Ok(HeaderFormat::Timestamp),
            other => other
                .parse::<u8>()
                .ok()
                .and_then(HeaderFormat::from_version)
                .ok_or_else(|| format!("Unknown header format '{}' (bare, sequence, timestamp or 0-2)", other)),
        }
    }
}

/// Decoded header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    None,
    Sequence(u32),
    Timestamp(i64),
}

/// 2010-01-01T00:00:00Z in Unix milliseconds, the zero of [`HeaderFormat::Timestamp`]
pub const HEADER_EPOCH_UNIX_MS: i64 = 1_262_304_000_000;

/// Current time in header units
pub fn header_timestamp_now() -> i64 {
    Utc::now().timestamp_millis() - HEADER_EPOCH_UNIX_MS
}

impl HeaderFormat {
    /// Header length in bytes
    pub const fn len(self) -> usize {
        match self {
            HeaderFormat::Bare => 0,
            HeaderFormat::Sequence => 4,
            HeaderFormat::Timestamp => 8,
        }
    }

    /// Split a datagram into its header and codec payload
    pub fn split(self, packet: &[u8]) -> Result<(PacketHeader, &[u8]), ProtocolError> {
        let header_len = self.len();
        if packet.len() < header_len {
            return Err(ProtocolError::Truncated {
                expected: header_len,
                actual: packet.len(),
            });
        }

        let (head, payload) = packet.split_at(header_len);
        let header = match self {
            HeaderFormat::Bare => PacketHeader::None,
            HeaderFormat::Sequence => {
                PacketHeader::Sequence(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
            }
            HeaderFormat::Timestamp => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(head);
                PacketHeader::Timestamp(i64::from_be_bytes(raw))
            }
        };

        Ok((header, payload))
    }
}

/// Produces headers for outgoing packets
#[derive(Debug, Clone)]
pub struct HeaderStamper {
    format: HeaderFormat,
    next_sequence: u32,
}

impl HeaderStamper {
    pub fn new(format: HeaderFormat) -> Self {
        Self {
            format,
            next_sequence: 0,
        }
    }

    pub fn format(&self) -> HeaderFormat {
        self.format
    }

    /// Prefix `payload` with the next header
    pub fn stamp(&mut self, payload: &[u8]) -> EncodedPacket {
        let mut buf = BytesMut::with_capacity(self.format.len() + payload.len());
        match self.format {
            HeaderFormat::Bare => {}
            HeaderFormat::Sequence => {
                buf.put_u32(self.next_sequence);
                self.next_sequence = self.next_sequence.wrapping_add(1);
            }
            HeaderFormat::Timestamp => buf.put_i64(header_timestamp_now()),
        }
        buf.put_slice(payload);
        EncodedPacket::new(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_header_passes_payload_through() {
        let (header, payload) = HeaderFormat::Bare.split(&[1, 2, 3]).unwrap();
        assert_eq!(header, PacketHeader::None);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_sequence_stamping() {
        let mut stamper = HeaderStamper::new(HeaderFormat::Sequence);
        let first = stamper.stamp(&[0xaa]);
        let second = stamper.stamp(&[0xbb, 0xcc]);

        assert_eq!(first.as_bytes(), &[0, 0, 0, 0, 0xaa]);
        let (header, payload) = HeaderFormat::Sequence.split(second.as_bytes()).unwrap();
        assert_eq!(header, PacketHeader::Sequence(1));
        assert_eq!(payload, &[0xbb, 0xcc]);
    }

    #[test]
    fn test_timestamp_is_recent() {
        let mut stamper = HeaderStamper::new(HeaderFormat::Timestamp);
        let packet = stamper.stamp(&[7]);
        assert_eq!(packet.len(), 9);

        let (header, payload) = HeaderFormat::Timestamp.split(packet.as_bytes()).unwrap();
        assert_eq!(payload, &[7]);
        match header {
            PacketHeader::Timestamp(ms) => {
                let drift = (header_timestamp_now() - ms).abs();
                assert!(drift < 5_000, "timestamp drift {} ms", drift);
            }
            other => panic!("unexpected header {:?}", other),
        }
    }

    #[test]
    fn test_parse_header_format() {
        assert_eq!("sequence".parse::<HeaderFormat>().unwrap(), HeaderFormat::Sequence);
        assert!("seq".parse::<HeaderFormat>().is_err());
        assert_eq!("2".parse::<HeaderFormat>().unwrap(), HeaderFormat::Timestamp);
        assert!("3".parse::<HeaderFormat>().is_err());
    }

    #[test]
    fn test_header_versions_are_stable() {
        assert_eq!(HeaderFormat::Bare.version(), 0);
        assert_eq!(HeaderFormat::Sequence.version(), 1);
        assert_eq!(HeaderFormat::Timestamp.version(), 2);
        for format in [HeaderFormat::Bare, HeaderFormat::Sequence, HeaderFormat::Timestamp] {
            assert_eq!(HeaderFormat::from_version(format.version()), Some(format));
        }
        assert_eq!(HeaderFormat::from_version(7), None);
    }

    #[test]
    fn test_truncated_packet() {
        let err = HeaderFormat::Timestamp.split(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { expected: 8, actual: 3 }));
    }
}
