//! [`ByteSink`]: the random-access output abstraction the serialiser writes through.
//!
//! A plain in-memory buffer implements everything the serialiser needs (`write`, `get_size`); the
//! file-backed implementation exists only to hand that buffer to disk once, atomically, at the
//! very end — squashfs's trailing superblock rewrite means nothing is safely streamable until the
//! whole image is known anyway.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// A growable, randomly-writable byte buffer: `write` may target any offset, including one
/// already-written (the superblock rewrite at offset 0).
pub(crate) trait ByteSink {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Error>;
    fn size(&self) -> u64;
    /// Pads with zero bytes up to `len`; `len` must be `>= size()`.
    fn pad_to(&mut self, len: u64) -> Result<(), Error>;
}

#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl ByteSink for MemorySink {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        let end = offset as usize + bytes.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn pad_to(&mut self, len: u64) -> Result<(), Error> {
        if len > self.buf.len() as u64 {
            self.buf.resize(len as usize, 0);
        }
        Ok(())
    }
}

/// Writes a finished image buffer out to `path`, refusing to clobber an existing file unless
/// `force` is set.
pub(crate) fn persist(path: &Path, bytes: &[u8], force: bool) -> Result<(), Error> {
    if path.exists() && !force {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists (use --force to overwrite)", path.display()),
        )));
    }

    let tmp_path = tmp_path_for(path);
    let mut file: File = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_at_extends_buffer_and_fills_gap_with_zero() {
        let mut sink = MemorySink::new();
        sink.write_at(4, b"hi").unwrap();
        assert_eq!(sink.size(), 6);
        assert_eq!(sink.into_bytes(), vec![0, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn write_at_zero_can_overwrite_a_prior_write() {
        let mut sink = MemorySink::new();
        sink.write_at(0, &[0xFF; 8]).unwrap();
        sink.write_at(0, b"SB").unwrap();
        let bytes = sink.into_bytes();
        assert_eq!(&bytes[..2], b"SB");
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn pad_to_rounds_up_with_zeroes() {
        let mut sink = MemorySink::new();
        sink.write_at(0, b"abc").unwrap();
        sink.pad_to(8).unwrap();
        assert_eq!(sink.size(), 8);
    }
}
