//! Relayed payloads and their stored record format
//!
//! Record format used by the durable buffer backend:
//! ```text
//! +--------+-------------------+------------------+-------------+
//! | kind   | timestamp         | length           | payload     |
//! | (1 byte)| (8 bytes, BE, ms) | (4 bytes, BE)    | (variable)  |
//! +--------+-------------------+------------------+-------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// Record header size: 1 byte kind + 8 bytes timestamp + 4 bytes length
pub const RECORD_HEADER_SIZE: usize = 13;

/// Largest payload a record may carry (16 MB)
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024 * 1024;

/// WebSocket frame kind a payload arrived as
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Binary = 0x00,
    Text = 0x01,
}

impl PayloadKind {
    /// Convert from u8, returns None for unknown kinds
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PayloadKind::Binary),
            0x01 => Some(PayloadKind::Text),
            _ => None,
        }
    }
}

/// An opaque relayed message. The broker never looks inside `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadKind,
    pub data: Bytes,
}

impl Payload {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Binary,
            data: data.into(),
        }
    }

    pub fn text(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Text,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A payload together with its arrival time, as held by a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRecord {
    pub payload: Payload,
    /// Arrival time in milliseconds since UNIX epoch
    pub timestamp: u64,
}

impl BufferedRecord {
    pub fn new(payload: Payload, timestamp: u64) -> Self {
        Self { payload, timestamp }
    }

    /// Get the total encoded size of this record
    pub fn encoded_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    /// Encode this record into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.payload.kind as u8);
        buf.put_u64(self.timestamp);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload.data);
    }

    /// Encode this record into a new Bytes
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a single record from a complete buffer
    pub fn decode_complete(data: &[u8]) -> io::Result<BufferedRecord> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Incomplete record header",
            ));
        }

        let kind = PayloadKind::from_u8(data[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown payload kind: 0x{:02X}", data[0]),
            )
        })?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[1..9]);
        let timestamp = u64::from_be_bytes(ts);
        let payload_len = u32::from_be_bytes([data[9], data[10], data[11], data[12]]) as usize;

        if payload_len > MAX_RECORD_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Record payload too large: {} bytes (max: {})",
                    payload_len, MAX_RECORD_PAYLOAD
                ),
            ));
        }

        let expected_len = RECORD_HEADER_SIZE + payload_len;
        if data.len() != expected_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Record length mismatch: expected {} bytes, got {}",
                    expected_len,
                    data.len()
                ),
            ));
        }

        Ok(BufferedRecord {
            payload: Payload {
                kind,
                data: Bytes::copy_from_slice(&data[RECORD_HEADER_SIZE..]),
            },
            timestamp,
        })
    }
}
