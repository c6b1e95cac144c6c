//! Write-through memory cache keyed by object id.
//!
//! Values live in shared immutable buffers: a read hands out an owning
//! `Arc` clone, so a reader keeps a valid view of the bytes even after the
//! entry is overwritten or removed. All map operations serialize on one
//! mutex; buffer access after a read needs no lock.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::{Arc, Mutex};

use crate::command::{Attr, Cmd, CmdKind, Handler, IoAttr, Reply};
use crate::error::Result;
use crate::{errdata, Error, ObjectId};

/// Pass-through hasher for keys that pre-fold themselves into a word.
/// [`ObjectId`] hashes by XOR-folding its bytes against a seed, so the map
/// does not need to run the bytes through SipHash again.
#[derive(Default)]
pub struct IdHasher(u64);

impl Hasher for IdHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write_u64(&mut self, value: u64) {
        self.0 = value;
    }

    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.0 ^= u64::from_le_bytes(word);
        }
    }
}

type IdMap = HashMap<ObjectId, Arc<[u8]>, BuildHasherDefault<IdHasher>>;

pub struct Cache {
    map: Mutex<IdMap>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            map: Mutex::new(IdMap::default()),
        }
    }

    /// Copies `data` into a fresh immutable buffer and installs it under
    /// `id`, replacing any prior buffer.
    pub fn write(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        self.map.lock()?.insert(*id, Arc::from(data));
        Ok(())
    }

    /// Returns an owning share of the current buffer for `id`.
    pub fn read(&self, id: &ObjectId) -> Result<Arc<[u8]>> {
        self.map.lock()?.get(id).cloned().ok_or(Error::NotFound)
    }

    /// Drops the mapping for `id`. Outstanding shares stay valid until the
    /// holders release them.
    pub fn remove(&self, id: &ObjectId) -> Result<()> {
        self.map.lock()?.remove(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Handler for Cache {
    fn command(&self, cmd: &Cmd, attr: &Attr, data: &[u8]) -> Result<Reply> {
        match attr.cmd {
            CmdKind::Write => {
                let (io, payload) = IoAttr::split(data)?;
                if io.size != payload.len() as u64 {
                    return errdata!(
                        "io size {} does not match payload length {}",
                        io.size,
                        payload.len()
                    );
                }
                self.write(&io.id, payload).map_err(|_| Error::NotFound)?;
                Ok(Reply::Ack)
            }
            CmdKind::Read => {
                let (io, _) = IoAttr::split(data)?;
                let buffer = self.read(&io.id).map_err(|e| {
                    tracing::error!("{}: cache read failed: {}", io.id, e);
                    Error::NotFound
                })?;

                if io.offset + io.size > buffer.len() as u64 {
                    tracing::error!(
                        "{}: cache: invalid offset/size: offset: {}, size: {}, cached-size: {}",
                        io.id,
                        io.offset,
                        io.size,
                        buffer.len()
                    );
                    return Err(Error::Range);
                }

                let size = if io.size == 0 {
                    buffer.len() as u64 - io.offset
                } else {
                    io.size
                };
                let start = io.offset as usize;
                let end = start + size as usize;
                Ok(Reply::inline(cmd, attr, &io, &buffer[start..end]))
            }
            CmdKind::Del => {
                self.remove(&cmd.id).map_err(|_| Error::NotFound)?;
                Ok(Reply::Ack)
            }
            CmdKind::List | CmdKind::Stat => Err(Error::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ATTR_SIZE, CMD_SIZE, ID_SIZE, IO_ATTR_SIZE};
    use std::thread;

    fn id(fill: u8) -> ObjectId {
        ObjectId::new([fill; ID_SIZE])
    }

    #[test]
    fn test_write_and_read() {
        let cache = Cache::new();
        cache.write(&id(1), b"red").expect("Failed to write");
        cache.write(&id(2), b"yellow").expect("Failed to write");

        assert_eq!(cache.read(&id(1)).unwrap().as_ref(), b"red");
        assert_eq!(cache.read(&id(2)).unwrap().as_ref(), b"yellow");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_write_replaces_prior_buffer() {
        let cache = Cache::new();
        cache.write(&id(1), b"first").expect("Failed to write");
        cache.write(&id(1), b"second").expect("Failed to write");

        assert_eq!(cache.read(&id(1)).unwrap().as_ref(), b"second");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_read_missing_id() {
        let cache = Cache::new();
        assert_eq!(cache.read(&id(9)), Err(Error::NotFound));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let cache = Cache::new();
        cache.write(&id(1), b"data").expect("Failed to write");
        cache.remove(&id(1)).expect("Failed to remove");
        cache.remove(&id(1)).expect("Second remove should succeed");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_outstanding_share_survives_removal() {
        let cache = Cache::new();
        cache.write(&id(1), b"persistent").expect("Failed to write");

        let share = cache.read(&id(1)).expect("Failed to read");
        cache.remove(&id(1)).expect("Failed to remove");

        assert_eq!(cache.read(&id(1)), Err(Error::NotFound));
        assert_eq!(share.as_ref(), b"persistent");
    }

    #[test]
    fn test_parallel_readers_share_one_buffer() {
        let cache = Arc::new(Cache::new());
        let value = vec![0xab; 4096];
        cache.write(&id(7), &value).expect("Failed to write");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let expected = value.clone();
                thread::spawn(move || {
                    let share = cache.read(&id(7)).expect("Failed to read");
                    assert_eq!(share.as_ref(), expected.as_slice());
                    share
                })
            })
            .collect();

        let shares: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("Reader thread panicked"))
            .collect();

        cache.remove(&id(7)).expect("Failed to remove");
        for share in shares {
            assert_eq!(share.len(), 4096);
        }
    }

    fn frame(io: &IoAttr, payload: &[u8]) -> Vec<u8> {
        let mut frame = io.encode().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_command_write_then_read() {
        let cache = Cache::new();
        let cmd = Cmd::new(id(3));

        let io = IoAttr::new(id(3), 5);
        let attr = Attr::new(CmdKind::Write, (IO_ATTR_SIZE + 5) as u64);
        let reply = cache
            .command(&cmd, &attr, &frame(&io, b"hello"))
            .expect("Write command failed");
        assert!(matches!(reply, Reply::Ack));

        let io = IoAttr::new(id(3), 0);
        let attr = Attr::new(CmdKind::Read, 4096);
        let reply = cache
            .command(&cmd, &attr, &io.encode())
            .expect("Read command failed");
        match reply {
            Reply::Inline(frame) => {
                assert_eq!(&frame[CMD_SIZE + ATTR_SIZE + IO_ATTR_SIZE..], b"hello");
            }
            other => panic!("Expected inline reply, got {:?}", other),
        }
    }

    #[test]
    fn test_command_read_range_check() {
        let cache = Cache::new();
        let cmd = Cmd::new(id(4));
        cache.write(&id(4), b"1234").expect("Failed to write");

        let mut io = IoAttr::new(id(4), 3);
        io.offset = 2;
        let attr = Attr::new(CmdKind::Read, 4096);
        let result = cache.command(&cmd, &attr, &io.encode());
        assert_eq!(result.err(), Some(Error::Range));
    }

    #[test]
    fn test_command_del_uses_cmd_id() {
        let cache = Cache::new();
        cache.write(&id(5), b"bytes").expect("Failed to write");

        let cmd = Cmd::new(id(5));
        let attr = Attr::new(CmdKind::Del, 0);
        cache.command(&cmd, &attr, &[]).expect("Del command failed");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_command_rejects_list() {
        let cache = Cache::new();
        let cmd = Cmd::new(id(6));
        let attr = Attr::new(CmdKind::List, 0);
        assert_eq!(cache.command(&cmd, &attr, &[]).err(), Some(Error::Unsupported));
    }

    #[test]
    fn test_write_size_mismatch() {
        let cache = Cache::new();
        let cmd = Cmd::new(id(8));
        let io = IoAttr::new(id(8), 10);
        let attr = Attr::new(CmdKind::Write, 0);
        let result = cache.command(&cmd, &attr, &frame(&io, b"short"));
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }
}
