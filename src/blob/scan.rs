//! Stream iteration for the startup index rebuild.
//!
//! Walks a stream file from offset 0 in on-disk order, yielding every record
//! together with its position. Tombstoned records are yielded as-is; the
//! rebuild decides what to skip. Block padding is honored: with a non-zero
//! block size the scanner advances to the next block boundary after each
//! record.

use std::fs::File;

use crate::blob::record::{RecordHeader, RECORD_HEADER_SIZE};
use crate::error::Result;
use crate::{errdata, pio};

/// Iterator over `(header, payload, position)` tuples of one stream.
pub struct StreamScanner<'a> {
    file: &'a File,
    block_size: u64,
    position: u64,
    end: u64,
}

impl<'a> StreamScanner<'a> {
    pub fn new(file: &'a File, block_size: u64) -> Result<Self> {
        let end = file.metadata()?.len();
        Ok(StreamScanner {
            file,
            block_size,
            position: 0,
            end,
        })
    }

    fn read(&mut self) -> Result<Option<(RecordHeader, Vec<u8>, u64)>> {
        if self.position >= self.end {
            return Ok(None);
        }

        let remaining = self.end - self.position;
        if remaining < RECORD_HEADER_SIZE as u64 {
            return errdata!(
                "truncated record header at {}: {} bytes left",
                self.position,
                remaining
            );
        }

        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        pio::read_full_at(self.file, &mut header_buf, self.position)?;
        let header = RecordHeader::decode(&header_buf)?;

        let body_end = self.position + RECORD_HEADER_SIZE as u64 + header.size;
        if body_end > self.end {
            return errdata!(
                "truncated record payload at {}: header claims {} bytes",
                self.position,
                header.size
            );
        }

        let mut payload = vec![0u8; header.size as usize];
        pio::read_full_at(self.file, &mut payload, self.position + RECORD_HEADER_SIZE as u64)?;

        let position = self.position;
        let mut total = RECORD_HEADER_SIZE as u64 + header.size;
        if self.block_size > 0 {
            total = total.div_ceil(self.block_size) * self.block_size;
        }
        self.position += total;

        Ok(Some((header, payload, position)))
    }
}

impl Iterator for StreamScanner<'_> {
    type Item = Result<(RecordHeader, Vec<u8>, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                // Stop after the first error; the stream is not walkable
                // past a corrupt record.
                self.position = self.end;
                Some(Err(e))
            }
        }
    }
}
