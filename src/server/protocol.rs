//! On-disk formats of the primary's change log.
//!
//! A segment file is a fixed header followed by a stream of blocks. Both
//! layouts are protocol-fixed by the primary; the applier validates headers
//! and treats block payloads as opaque bytes for the replica.
//!
//! ```text
//! [Segment header: 44 bytes]
//! [Block 0: 20-byte header + data_length + meta_length bytes]
//! [Block 1: ...]
//! ```

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

pub const SEGMENT_SIGNATURE: &[u8; 10] = b"FBREPLLOG\0";
pub const SEGMENT_VERSION: u16 = 1;
pub const PROTOCOL_VERSION: u16 = 1;

/// Signature + version + protocol + state + guid + sequence + length.
pub const SEGMENT_HEADER_LEN: usize = 10 + 2 + 2 + 2 + 16 + 8 + 4;

/// Transaction id + flags + data length + meta length.
pub const BLOCK_HEADER_LEN: usize = 8 + 4 + 4 + 4;

/// Block opens the transaction carried in its header.
pub const BLOCK_BEGIN_TRANS: u32 = 0x01;
/// Block closes the transaction carried in its header.
pub const BLOCK_END_TRANS: u32 = 0x02;

/// Lifecycle state stamped into a segment header by the primary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum SegmentState {
    Free = 1,
    Used = 2,
    Full = 3,
    Arch = 4,
}

impl SegmentState {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Free),
            2 => Some(Self::Used),
            3 => Some(Self::Full),
            4 => Some(Self::Arch),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "FREE",
            Self::Used => "USED",
            Self::Full => "FULL",
            Self::Arch => "ARCH",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unknown signature")]
    Signature,
    #[error("unsupported version {got} (supported: {SEGMENT_VERSION})")]
    Version { got: u16 },
    #[error("unsupported protocol {got} (supported: {PROTOCOL_VERSION})")]
    Protocol { got: u16 },
    #[error("unknown segment state {got}")]
    State { got: u16 },
}

/// Decoded segment header.
///
/// `version` and `protocol` are not stored: decoding rejects anything but
/// the current constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub state: SegmentState,
    pub guid: Uuid,
    pub sequence: u64,
    pub length: u32,
}

impl SegmentHeader {
    /// Decode and validate a segment header.
    ///
    /// Any error means "not a segment we understand": the scanner skips the
    /// file rather than failing the pass.
    pub fn decode(bytes: &[u8; SEGMENT_HEADER_LEN]) -> Result<Self, HeaderError> {
        if &bytes[..SEGMENT_SIGNATURE.len()] != SEGMENT_SIGNATURE {
            return Err(HeaderError::Signature);
        }

        let mut offset = SEGMENT_SIGNATURE.len();
        let version = read_u16_le(bytes, &mut offset);
        if version != SEGMENT_VERSION {
            return Err(HeaderError::Version { got: version });
        }
        let protocol = read_u16_le(bytes, &mut offset);
        if protocol != PROTOCOL_VERSION {
            return Err(HeaderError::Protocol { got: protocol });
        }
        let raw_state = read_u16_le(bytes, &mut offset);
        let state = SegmentState::from_raw(raw_state)
            .ok_or(HeaderError::State { got: raw_state })?;
        let guid = read_uuid(bytes, &mut offset);
        let sequence = read_u64_le(bytes, &mut offset);
        let length = read_u32_le(bytes, &mut offset);

        Ok(Self {
            state,
            guid,
            sequence,
            length,
        })
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[..SEGMENT_SIGNATURE.len()].copy_from_slice(SEGMENT_SIGNATURE);
        let mut offset = SEGMENT_SIGNATURE.len();
        write_u16_le(&mut buf, &mut offset, SEGMENT_VERSION);
        write_u16_le(&mut buf, &mut offset, PROTOCOL_VERSION);
        write_u16_le(&mut buf, &mut offset, self.state as u16);
        buf[offset..offset + 16].copy_from_slice(self.guid.as_bytes());
        offset += 16;
        write_u64_le(&mut buf, &mut offset, self.sequence);
        write_u32_le(&mut buf, &mut offset, self.length);
        buf
    }
}

/// Fixed-size prefix of one block within a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Zero for non-transactional frames.
    pub transaction_id: u64,
    pub flags: u32,
    pub data_length: u32,
    pub meta_length: u32,
}

impl BlockHeader {
    pub fn decode(bytes: &[u8; BLOCK_HEADER_LEN]) -> Self {
        let mut offset = 0;
        let transaction_id = read_u64_le(bytes, &mut offset);
        let flags = read_u32_le(bytes, &mut offset);
        let data_length = read_u32_le(bytes, &mut offset);
        let meta_length = read_u32_le(bytes, &mut offset);
        Self {
            transaction_id,
            flags,
            data_length,
            meta_length,
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        let mut offset = 0;
        write_u64_le(&mut buf, &mut offset, self.transaction_id);
        write_u32_le(&mut buf, &mut offset, self.flags);
        write_u32_le(&mut buf, &mut offset, self.data_length);
        write_u32_le(&mut buf, &mut offset, self.meta_length);
        buf
    }

    /// Opaque payload bytes following the header.
    pub fn payload_len(&self) -> u64 {
        u64::from(self.data_length) + u64::from(self.meta_length)
    }

    pub fn begins_transaction(&self) -> bool {
        self.flags & BLOCK_BEGIN_TRANS != 0
    }

    pub fn ends_transaction(&self) -> bool {
        self.flags & BLOCK_END_TRANS != 0
    }
}

pub(crate) fn read_u16_le(bytes: &[u8], offset: &mut usize) -> u16 {
    let value = u16::from_le_bytes([bytes[*offset], bytes[*offset + 1]]);
    *offset += 2;
    value
}

pub(crate) fn read_u32_le(bytes: &[u8], offset: &mut usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[*offset..*offset + 4]);
    *offset += 4;
    u32::from_le_bytes(arr)
}

pub(crate) fn read_u64_le(bytes: &[u8], offset: &mut usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[*offset..*offset + 8]);
    *offset += 8;
    u64::from_le_bytes(arr)
}

fn read_uuid(bytes: &[u8], offset: &mut usize) -> Uuid {
    let mut arr = [0u8; 16];
    arr.copy_from_slice(&bytes[*offset..*offset + 16]);
    *offset += 16;
    Uuid::from_bytes(arr)
}

fn write_u16_le(buf: &mut [u8], offset: &mut usize, value: u16) {
    buf[*offset..*offset + 2].copy_from_slice(&value.to_le_bytes());
    *offset += 2;
}

fn write_u32_le(buf: &mut [u8], offset: &mut usize, value: u32) {
    buf[*offset..*offset + 4].copy_from_slice(&value.to_le_bytes());
    *offset += 4;
}

fn write_u64_le(buf: &mut [u8], offset: &mut usize, value: u64) {
    buf[*offset..*offset + 8].copy_from_slice(&value.to_le_bytes());
    *offset += 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> SegmentHeader {
        SegmentHeader {
            state: SegmentState::Full,
            guid: Uuid::from_bytes([7u8; 16]),
            sequence: 42,
            length: 1024,
        }
    }

    #[test]
    fn segment_header_roundtrip() {
        let header = sample_header();
        let bytes = header.encode();
        let decoded = SegmentHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn segment_header_rejects_bad_signature() {
        let mut bytes = sample_header().encode();
        bytes[0] ^= 0xFF;
        assert_eq!(SegmentHeader::decode(&bytes), Err(HeaderError::Signature));
    }

    #[test]
    fn segment_header_rejects_unknown_version() {
        let mut bytes = sample_header().encode();
        bytes[10..12].copy_from_slice(&99u16.to_le_bytes());
        assert_eq!(
            SegmentHeader::decode(&bytes),
            Err(HeaderError::Version { got: 99 })
        );
    }

    #[test]
    fn segment_header_rejects_unknown_protocol() {
        let mut bytes = sample_header().encode();
        bytes[12..14].copy_from_slice(&7u16.to_le_bytes());
        assert_eq!(
            SegmentHeader::decode(&bytes),
            Err(HeaderError::Protocol { got: 7 })
        );
    }

    #[test]
    fn segment_header_rejects_unknown_state() {
        let mut bytes = sample_header().encode();
        bytes[14..16].copy_from_slice(&9u16.to_le_bytes());
        assert_eq!(
            SegmentHeader::decode(&bytes),
            Err(HeaderError::State { got: 9 })
        );
    }

    #[test]
    fn all_states_roundtrip() {
        for state in [
            SegmentState::Free,
            SegmentState::Used,
            SegmentState::Full,
            SegmentState::Arch,
        ] {
            assert_eq!(SegmentState::from_raw(state as u16), Some(state));
        }
        assert_eq!(SegmentState::from_raw(0), None);
        assert_eq!(SegmentState::from_raw(5), None);
    }

    #[test]
    fn block_header_roundtrip() {
        let header = BlockHeader {
            transaction_id: 17,
            flags: BLOCK_BEGIN_TRANS | BLOCK_END_TRANS,
            data_length: 100,
            meta_length: 28,
        };
        let decoded = BlockHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_len(), 128);
        assert!(decoded.begins_transaction());
        assert!(decoded.ends_transaction());
    }

    #[test]
    fn payload_len_does_not_overflow() {
        let header = BlockHeader {
            transaction_id: 0,
            flags: 0,
            data_length: u32::MAX,
            meta_length: u32::MAX,
        };
        assert_eq!(header.payload_len(), 2 * u64::from(u32::MAX));
    }
}
