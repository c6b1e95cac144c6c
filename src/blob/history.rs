//! Per-object history entries and the history rewrite hook.
//!
//! Every data write is mirrored by a fixed-size entry appended to the
//! object's history block, recording where the write landed. The block
//! itself is rewritten through [`ProcessMeta`], which receives the previous
//! block and the incoming payload and returns the block to re-append.

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::command::{IoAttr, ObjectId, ID_SIZE, IO_FLAGS_APPEND};
use crate::error::Result;
use crate::{errdata, Error};

/// On-disk length of a history entry.
pub const HISTORY_ENTRY_SIZE: usize = ID_SIZE + 8 * 5;

/// One line of an object's history: which bytes were written where, and when.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub id: ObjectId,
    pub flags: u64,
    pub offset: u64,
    pub size: u64,
    pub tsec: u64,
    pub tnsec: u64,
}

impl HistoryEntry {
    /// Builds an entry for a data write, stamped with the current wall clock.
    pub fn new(id: ObjectId, size: u64, offset: u64, flags: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        HistoryEntry {
            id,
            flags,
            offset,
            size,
            tsec: now.as_secs(),
            tnsec: now.subsec_nanos() as u64,
        }
    }

    pub fn encode(&self) -> [u8; HISTORY_ENTRY_SIZE] {
        let mut buf = [0u8; HISTORY_ENTRY_SIZE];
        buf[..ID_SIZE].copy_from_slice(self.id.as_bytes());
        let mut w = &mut buf[ID_SIZE..];
        w.write_u64::<BigEndian>(self.flags).unwrap();
        w.write_u64::<BigEndian>(self.offset).unwrap();
        w.write_u64::<BigEndian>(self.size).unwrap();
        w.write_u64::<BigEndian>(self.tsec).unwrap();
        w.write_u64::<BigEndian>(self.tnsec).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HISTORY_ENTRY_SIZE]) -> Result<Self> {
        let id = ObjectId::from_slice(&buf[..ID_SIZE])?;
        let mut r = &buf[ID_SIZE..];
        let flags = r.read_u64::<BigEndian>()?;
        let offset = r.read_u64::<BigEndian>()?;
        let size = r.read_u64::<BigEndian>()?;
        let tsec = r.read_u64::<BigEndian>()?;
        let tnsec = r.read_u64::<BigEndian>()?;
        Ok(HistoryEntry {
            id,
            flags,
            offset,
            size,
            tsec,
            tnsec,
        })
    }
}

impl TryFrom<&[u8]> for HistoryEntry {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HISTORY_ENTRY_SIZE {
            return errdata!(
                "history entry needs {} bytes, got {}",
                HISTORY_ENTRY_SIZE,
                bytes.len()
            );
        }
        HistoryEntry::decode(bytes[..HISTORY_ENTRY_SIZE].try_into().unwrap())
    }
}

/// Hook invoked during a history rewrite, under the backend lock.
///
/// Receives the IO attributes of the triggering write, the object's previous
/// history block (empty when the object has none) and the incoming payload,
/// and returns the full block to re-append. A failing hook aborts the
/// rewrite; the stream offset and index are left unchanged.
pub type ProcessMeta = dyn Fn(&IoAttr, Vec<u8>, &[u8]) -> Result<Vec<u8>> + Send + Sync;

/// Default hook. With `IO_FLAGS_APPEND` the payload is concatenated onto the
/// existing block (the history log grows); without it the payload replaces
/// the block.
pub fn append_meta(io: &IoAttr, mut old: Vec<u8>, data: &[u8]) -> Result<Vec<u8>> {
    if io.flags & IO_FLAGS_APPEND != 0 {
        old.extend_from_slice(data);
        Ok(old)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(fill: u8) -> ObjectId {
        ObjectId::new([fill; ID_SIZE])
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = HistoryEntry {
            id: id(0x21),
            flags: 6,
            offset: 4096,
            size: 100,
            tsec: 1700000000,
            tnsec: 999,
        };

        let encoded = entry.encode();
        assert_eq!(encoded.len(), HISTORY_ENTRY_SIZE);

        let decoded = HistoryEntry::decode(&encoded).expect("Failed to decode entry");
        assert_eq!(entry, decoded);
    }

    #[test]
    fn test_entry_short_buffer() {
        let short = [0u8; HISTORY_ENTRY_SIZE - 8];
        assert!(matches!(
            HistoryEntry::try_from(&short[..]),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_new_entry_is_timestamped() {
        let entry = HistoryEntry::new(id(1), 10, 0, 0);
        assert!(entry.tsec > 0);
    }

    #[test]
    fn test_append_meta_concatenates() {
        let mut io = IoAttr::new(id(2), 3);
        io.flags = IO_FLAGS_APPEND;

        let block = append_meta(&io, b"old".to_vec(), b"new").expect("Hook failed");
        assert_eq!(block, b"oldnew");
    }

    #[test]
    fn test_append_meta_replaces_without_flag() {
        let io = IoAttr::new(id(2), 3);

        let block = append_meta(&io, b"old".to_vec(), b"new").expect("Hook failed");
        assert_eq!(block, b"new");
    }
}
