//! On-disk record layout for the blob streams.
//!
//! Each stream is a flat sequence of records with no file header or magic:
//!
//! ```text
//! +-----------------+-----------+-----------+------------------+---------+
//! | id (20 bytes)   | flags:u64 | size:u64  | payload (size)   | padding |
//! +-----------------+-----------+-----------+------------------+---------+
//! ```
//!
//! Integers are big-endian on disk and converted on every read and write.
//! When a stream has a non-zero block size, zero padding extends each record
//! to the next block boundary; the padding belongs to the record and is
//! counted in its index entry.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::command::{ObjectId, ID_SIZE};
use crate::error::Result;
use crate::{errdata, Error};

/// On-disk length of a record header.
pub const RECORD_HEADER_SIZE: usize = ID_SIZE + 8 + 8;

/// Tombstone: the record is dead and must be ignored by lookups and rebuild.
pub const RECORD_FLAGS_REMOVE: u64 = 1 << 0;

/// Selects which stream a record belongs to. History and data records for
/// the same id are independent index entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamTag {
    Data = 0,
    History = 1,
}

impl StreamTag {
    /// Index key for an id in this stream: the id bytes followed by the
    /// stream tag byte.
    pub fn key(self, id: &ObjectId) -> [u8; ID_SIZE + 1] {
        let mut key = [0u8; ID_SIZE + 1];
        key[..ID_SIZE].copy_from_slice(id.as_bytes());
        key[ID_SIZE] = self as u8;
        key
    }
}

/// Header preceding every record payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordHeader {
    pub id: ObjectId,
    pub flags: u64,
    /// Payload length in bytes, excluding the header and padding.
    pub size: u64,
}

impl RecordHeader {
    pub fn new(id: ObjectId, size: u64) -> Self {
        RecordHeader { id, flags: 0, size }
    }

    pub fn is_removed(&self) -> bool {
        self.flags & RECORD_FLAGS_REMOVE != 0
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[..ID_SIZE].copy_from_slice(self.id.as_bytes());
        let mut w = &mut buf[ID_SIZE..];
        w.write_u64::<BigEndian>(self.flags).unwrap();
        w.write_u64::<BigEndian>(self.size).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; RECORD_HEADER_SIZE]) -> Result<Self> {
        let id = ObjectId::from_slice(&buf[..ID_SIZE])?;
        let mut r = &buf[ID_SIZE..];
        let flags = r.read_u64::<BigEndian>()?;
        let size = r.read_u64::<BigEndian>()?;
        Ok(RecordHeader { id, flags, size })
    }
}

impl TryFrom<&[u8]> for RecordHeader {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return errdata!(
                "record header needs {} bytes, got {}",
                RECORD_HEADER_SIZE,
                bytes.len()
            );
        }
        RecordHeader::decode(bytes[..RECORD_HEADER_SIZE].try_into().unwrap())
    }
}
