//! Positional file I/O for the append-only streams.
//!
//! Appends and header rewrites land at explicit offsets, never through a
//! seeking writer, so concurrent readers can be handed the same descriptor.
//! The write path retries partial writes until the buffer is fully on disk
//! or the operating system reports an error.

use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Writes all of `buf` at `offset`, retrying partial writes.
pub fn write_full_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match write_at(file, &buf[written..], offset + written as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fills all of `buf` from `offset`, retrying partial reads.
pub fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut read = 0;
    while read < buf.len() {
        match read_at(file, &mut buf[read..], offset + read as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.seek_write(buf, offset)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

/// Advises the kernel the file will be read front to back.
#[cfg(target_os = "linux")]
pub fn advise_sequential(file: &File, len: u64) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, len as libc::off_t, libc::POSIX_FADV_SEQUENTIAL);
    }
}

/// Advises the kernel the file will be accessed at random offsets.
#[cfg(target_os = "linux")]
pub fn advise_random(file: &File, len: u64) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, len as libc::off_t, libc::POSIX_FADV_RANDOM);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn advise_sequential(_file: &File, _len: u64) {}

#[cfg(not(target_os = "linux"))]
pub fn advise_random(_file: &File, _len: u64) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    #[test]
    fn test_write_and_read_at_offset() {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let file = temp.reopen().expect("Failed to open temp file");

        write_full_at(&file, b"0123456789", 0).expect("Failed to write");
        write_full_at(&file, b"abcd", 4).expect("Failed to overwrite");

        let mut buf = [0u8; 10];
        read_full_at(&file, &mut buf, 0).expect("Failed to read");
        assert_eq!(&buf, b"0123abcd89");
    }

    #[test]
    fn test_write_past_end_extends_file() {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let file = temp.reopen().expect("Failed to open temp file");

        write_full_at(&file, b"tail", 100).expect("Failed to write");
        assert_eq!(file.metadata().unwrap().len(), 104);

        // The hole reads back as zeroes.
        let mut buf = [0u8; 104];
        read_full_at(&file, &mut buf, 0).expect("Failed to read");
        assert!(buf[..100].iter().all(|&b| b == 0));
        assert_eq!(&buf[100..], b"tail");
    }

    #[test]
    fn test_read_past_end_fails() {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let file = temp.reopen().expect("Failed to open temp file");
        write_full_at(&file, b"short", 0).expect("Failed to write");

        let mut buf = [0u8; 16];
        let err = read_full_at(&file, &mut buf, 0).expect_err("Read should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_advise_is_harmless() {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let file = temp.reopen().expect("Failed to open temp file");
        advise_sequential(&file, 0);
        advise_random(&file, 0);
    }
}
