//! Append-only blob backend.
//!
//! Objects and their per-object history live in two flat stream files:
//!
//! ```text
//!             +--------------------+     +-----------------------+
//!   WRITE --> | data stream        |     | history stream        |
//!             |  record | record.. |     |  record | record..    |
//!             +--------------------+     +-----------------------+
//!                  ^                          ^
//!                  |   in-memory index        |
//!                  +--- (id + tag) -> (offset, on-disk size)
//! ```
//!
//! Writes append; nothing is updated in place except record headers, which
//! are rewritten once to set the tombstone flag when a history block is
//! superseded. The index holds the position of the most recent live record
//! per `(id, stream)` and is rebuilt from the files at startup by scanning
//! each stream in on-disk order, so the last surviving record wins.
//!
//! A single mutex serializes appends and history rewrites; the backend is
//! single-writer by design. Reads resolve the record position under the
//! lock, then fetch the bytes (or hand the dispatcher a sendfile
//! descriptor) after releasing it.

pub mod history;
pub mod record;
pub mod scan;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::command::{
    Attr, Cmd, CmdKind, Handler, IoAttr, ObjectId, Reply, IO_ATTR_SIZE, IO_FLAGS_APPEND,
    IO_FLAGS_HISTORY, IO_FLAGS_META, IO_FLAGS_NO_HISTORY_UPDATE,
};
use crate::config::BlobConfig;
use crate::error::Result;
use crate::index::{IndexMap, RamControl};
use crate::{errdata, pio, Error};

use history::{append_meta, HistoryEntry, ProcessMeta, HISTORY_ENTRY_SIZE};
use record::{RecordHeader, StreamTag, RECORD_FLAGS_REMOVE, RECORD_HEADER_SIZE};
use scan::StreamScanner;

/// Staging buffer for zero padding; pads longer than this are written in
/// bounded chunks.
static PAD_ZEROES: [u8; 40 * 1024] = [0u8; 40 * 1024];

/// One append-only stream file and its alignment.
struct Stream {
    file: File,
    path: PathBuf,
    block_size: u64,
    tag: StreamTag,
}

impl Stream {
    fn open(path: &Path, block_size: u64, tag: StreamTag) -> Result<Self> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Config(format!("failed to open {}: {}", path.display(), e)))?;
        pio::advise_sequential(&file, file.metadata()?.len());

        Ok(Stream {
            file,
            path: path.to_path_buf(),
            block_size,
            tag,
        })
    }

    /// Robust positional write; errors leave the caller's offset untouched.
    fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        pio::write_full_at(&self.file, buf, offset).map_err(|e| {
            tracing::error!(
                "blob: failed to write {} bytes into {} at {}: {}",
                buf.len(),
                self.path.display(),
                offset,
                e
            );
            Error::IO(e.to_string())
        })
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        pio::read_full_at(&self.file, buf, offset).map_err(|e| {
            tracing::error!(
                "blob: failed to read {} bytes from {} at {}: {}",
                buf.len(),
                self.path.display(),
                offset,
                e
            );
            Error::IO(e.to_string())
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Mutable backend state guarded by the single backend lock.
struct BackendState {
    index: IndexMap,
    data_offset: u64,
    history_offset: u64,
}

impl BackendState {
    fn offset(&self, tag: StreamTag) -> u64 {
        match tag {
            StreamTag::Data => self.data_offset,
            StreamTag::History => self.history_offset,
        }
    }

    fn advance(&mut self, tag: StreamTag, total: u64) {
        match tag {
            StreamTag::Data => self.data_offset += total,
            StreamTag::History => self.history_offset += total,
        }
    }
}

pub struct BlobStore {
    data: Stream,
    history: Stream,
    state: Mutex<BackendState>,
    process_meta: Box<ProcessMeta>,
    /// Sync frequency from the config. Accepted, not applied yet.
    sync: u32,
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("data", &self.data.path)
            .field("history", &self.history.path)
            .field("sync", &self.sync)
            .finish()
    }
}

impl BlobStore {
    /// Opens the backend with the default history hook (append semantics).
    pub fn open(config: BlobConfig) -> Result<Self> {
        Self::open_with_meta(config, Box::new(append_meta))
    }

    /// Opens both stream files, rebuilds the index from their contents, and
    /// installs `process_meta` as the history rewrite hook.
    pub fn open_with_meta(config: BlobConfig, process_meta: Box<ProcessMeta>) -> Result<Self> {
        if config.data.as_os_str().is_empty() || config.history.as_os_str().is_empty() {
            return Err(Error::Config(
                "no data/history file configured".to_string(),
            ));
        }

        let data = Stream::open(&config.data, config.data_block_size, StreamTag::Data)?;
        let history = Stream::open(&config.history, config.history_block_size, StreamTag::History)?;

        let mut index = IndexMap::new(config.buckets(), config.hash_table_flags);

        let data_offset = rebuild(&mut index, &data)?;
        pio::advise_random(&data.file, data_offset);

        let history_offset = rebuild(&mut index, &history)?;
        pio::advise_random(&history.file, history_offset);

        if config.sync != 0 {
            tracing::warn!("blob: sync option is set to {} but not applied", config.sync);
        }

        tracing::info!(
            "blob: backend ready: {} index entries, data: {} bytes, history: {} bytes",
            index.len(),
            data_offset,
            history_offset
        );

        Ok(BlobStore {
            data,
            history,
            state: Mutex::new(BackendState {
                index,
                data_offset,
                history_offset,
            }),
            process_meta,
            sync: config.sync,
        })
    }

    fn stream(&self, tag: StreamTag) -> &Stream {
        match tag {
            StreamTag::Data => &self.data,
            StreamTag::History => &self.history,
        }
    }

    /// Appends one record to `stream` at its current offset and installs the
    /// index entry. Must run under the backend lock. On any write error the
    /// stream offset stays put and the half-written bytes are unreachable.
    fn append(
        &self,
        state: &mut BackendState,
        stream: &Stream,
        id: &ObjectId,
        payload: &[u8],
    ) -> Result<RamControl> {
        let offset = state.offset(stream.tag);
        let header = RecordHeader::new(*id, payload.len() as u64);

        stream.write(&header.encode(), offset)?;
        stream.write(payload, offset + RECORD_HEADER_SIZE as u64)?;

        let mut end = offset + RECORD_HEADER_SIZE as u64 + payload.len() as u64;
        if stream.block_size > 0 {
            let pad = stream.block_size - ((end - offset) % stream.block_size);
            // pad == block_size means the record already ends on a boundary
            if pad < stream.block_size {
                let mut left = pad as usize;
                while left > 0 {
                    let chunk = left.min(PAD_ZEROES.len());
                    stream.write(&PAD_ZEROES[..chunk], end)?;
                    end += chunk as u64;
                    left -= chunk;
                }
            }
        }

        let ctl = RamControl {
            offset,
            size: end - offset,
        };
        state.index.replace(&stream.tag.key(id), ctl);
        state.advance(stream.tag, ctl.size);

        tracing::debug!(
            "blob: {}: written history: {}, position: {}, size: {}, on-disk-size: {}",
            id,
            stream.tag == StreamTag::History,
            ctl.offset,
            payload.len(),
            ctl.size
        );

        Ok(ctl)
    }

    /// Rewrites the object's history block: reads the current block, marks
    /// its on-disk copy removed, runs the hook, and re-appends the result.
    /// The tombstone and the new append are observed atomically by readers
    /// because the whole sequence holds the backend lock.
    fn write_history(&self, io: &IoAttr, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock()?;
        let key = StreamTag::History.key(&io.origin);

        let mut old_block = Vec::new();
        if let Some(ctl) = state.index.lookup(&key) {
            tracing::info!(
                "blob: {}: found existing history block at: {}, size: {}",
                io.origin,
                ctl.offset,
                ctl.size
            );

            let mut header_buf = [0u8; RECORD_HEADER_SIZE];
            self.history.read(&mut header_buf, ctl.offset)?;
            let mut header = RecordHeader::decode(&header_buf)?;

            old_block = vec![0u8; header.size as usize];
            self.history
                .read(&mut old_block, ctl.offset + RECORD_HEADER_SIZE as u64)?;

            // Tombstone the on-disk copy only; the block just read stays
            // live and feeds the rewrite.
            header.flags |= RECORD_FLAGS_REMOVE;
            self.history.write(&header.encode(), ctl.offset)?;
        }

        let new_block = (self.process_meta)(io, old_block, data).map_err(|e| {
            tracing::error!("blob: {}: history rewrite hook failed: {}", io.origin, e);
            e
        })?;

        self.append(&mut state, &self.history, &io.origin, &new_block)?;
        Ok(())
    }

    /// WRITE: appends the payload to the data stream, or routes it through
    /// the history rewrite when `IO_FLAGS_HISTORY` is set. A plain data
    /// write is mirrored by a synthetic history entry unless
    /// `IO_FLAGS_NO_HISTORY_UPDATE` suppresses it.
    pub fn write(&self, io: &IoAttr, data: &[u8]) -> Result<()> {
        if io.size != data.len() as u64 {
            return errdata!(
                "io size {} does not match payload length {}",
                io.size,
                data.len()
            );
        }

        if io.flags & IO_FLAGS_HISTORY != 0 {
            self.write_history(io, data)?;
        } else {
            {
                let mut state = self.state.lock()?;
                self.append(&mut state, &self.data, &io.origin, data)?;
            }

            if io.flags & IO_FLAGS_NO_HISTORY_UPDATE == 0 {
                let entry = HistoryEntry::new(io.id, io.size, io.offset, io.flags);

                let mut hio = *io;
                hio.flags = (io.flags | IO_FLAGS_APPEND | IO_FLAGS_HISTORY) & !IO_FLAGS_META;
                hio.size = HISTORY_ENTRY_SIZE as u64;
                hio.offset = 0;
                self.write_history(&hio, &entry.encode())?;
            }
        }

        tracing::debug!(
            "blob: {}: IO offset: {}, size: {}",
            io.origin,
            io.offset,
            io.size
        );
        Ok(())
    }

    /// READ: resolves the record under the lock, then serves the bytes
    /// outside it. With `io.size == 0` the whole stored payload is returned.
    /// A reply buffer that only fits the request header selects the
    /// zero-copy descriptor path.
    pub fn read(&self, cmd: &Cmd, attr: &Attr, io: &IoAttr) -> Result<Reply> {
        let tag = if io.flags & IO_FLAGS_HISTORY != 0 {
            StreamTag::History
        } else {
            StreamTag::Data
        };
        let stream = self.stream(tag);

        let ctl = {
            let state = self.state.lock()?;
            state.index.lookup(&tag.key(&io.origin)).ok_or_else(|| {
                tracing::error!("blob: {}: could not find data", io.origin);
                Error::NotFound
            })?
        };

        let stored = ctl.size - RECORD_HEADER_SIZE as u64;
        let size = if io.size == 0 { stored } else { io.size };
        if io.offset + size > stored {
            return Err(Error::Range);
        }

        let offset = ctl.offset + RECORD_HEADER_SIZE as u64 + io.offset;

        if attr.size == IO_ATTR_SIZE as u64 {
            tracing::debug!(
                "blob: {}: read: requested offset: {}, size: {}, stored-size: {}, data lives at: {}",
                io.origin,
                io.offset,
                size,
                ctl.size,
                ctl.offset
            );
            let file = stream.file.try_clone()?;
            Ok(Reply::sendfile(cmd, attr, io, file, offset, size))
        } else {
            let capacity = (attr.size as usize).saturating_sub(IO_ATTR_SIZE) as u64;
            let size = size.min(capacity);

            let mut buf = vec![0u8; size as usize];
            stream.read(&mut buf, offset)?;
            Ok(Reply::inline(cmd, attr, io, &buf))
        }
    }

    /// DELETE is not wired up yet.
    pub fn del(&self, _id: &ObjectId) -> Result<()> {
        // TODO: tombstone the object's data and history records and drop
        // their index entries; nothing is reclaimed until that lands.
        Err(Error::Unsupported)
    }
}

impl Handler for BlobStore {
    fn command(&self, cmd: &Cmd, attr: &Attr, data: &[u8]) -> Result<Reply> {
        match attr.cmd {
            CmdKind::Write => {
                let (io, payload) = IoAttr::split(data)?;
                self.write(&io, payload)?;
                Ok(Reply::Ack)
            }
            CmdKind::Read => {
                let (io, _) = IoAttr::split(data)?;
                self.read(cmd, attr, &io)
            }
            CmdKind::Del => self.del(&cmd.id).map(|_| Reply::Ack),
            // LIST is not implemented; STAT is answered by the enclosing
            // node, not the storage core.
            CmdKind::List | CmdKind::Stat => Err(Error::Unsupported),
        }
    }
}

/// Scans one stream from offset 0 and installs an index entry for every
/// record that is not tombstoned. Iteration order makes the last surviving
/// record win. Returns the stream length, which becomes the append offset.
fn rebuild(index: &mut IndexMap, stream: &Stream) -> Result<u64> {
    let mut scanned = 0usize;
    let mut live = 0usize;

    for item in StreamScanner::new(&stream.file, stream.block_size)? {
        let (header, _payload, position) = item?;
        tracing::debug!(
            "blob: {} ({:?}): position: {}, size: {}, flags: {:#x}",
            header.id,
            stream.tag,
            position,
            header.size,
            header.flags
        );

        scanned += 1;
        if header.is_removed() {
            continue;
        }

        index.replace(
            &stream.tag.key(&header.id),
            RamControl {
                offset: position,
                size: header.size + RECORD_HEADER_SIZE as u64,
            },
        );
        live += 1;
    }

    let len = stream.len()?;
    tracing::info!(
        "blob: {} rebuilt: {} records scanned, {} live, {} bytes",
        stream.path.display(),
        scanned,
        live,
        len
    );
    Ok(len)
}
