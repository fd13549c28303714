//! Metadata blocks: the 8-KiB-chunked, length-prefixed container inodes and directory listings
//! are packed into.

use std::io::Write;

use deku::prelude::*;

use crate::compressor::{self, FilesystemCompressor};
use crate::error::Error;

/// Maximum uncompressed payload of a single metadata block.
pub const METADATA_MAXSIZE: usize = 8192;

const METADATA_COMPRESSED: u16 = 1 << 15;

/// On-disk framing of one metadata block: a 16-bit length (top bit = "stored uncompressed")
/// followed by that many bytes of payload.
#[derive(Debug, DekuRead, DekuWrite)]
pub struct Metadata {
    pub(crate) len: u16,
    #[deku(count = "Self::len(*len)")]
    pub(crate) data: Vec<u8>,
}

impl Metadata {
    /// Check is_compressed bit within raw `len`
    pub fn is_compressed(len: u16) -> bool {
        len & METADATA_COMPRESSED == 0
    }

    /// Get actual length of `data` following `len` from unedited `len`
    pub fn len(len: u16) -> u16 {
        len & !(METADATA_COMPRESSED)
    }

    pub fn set_if_uncompressed(len: u16) -> u16 {
        len | METADATA_COMPRESSED
    }
}

/// A logical position into a metadata table: a block's byte offset within the table, and a byte
/// offset within that block's *decompressed* payload.
pub type MetadataPosition = (u32, u16);

/// Buffers writes and flushes 8-KiB chunks into length-prefixed, optionally-compressed blocks.
///
/// Two independent instances exist per image: one for the inode table, one for the directory
/// table. Both are flushed only once, at the very end of serialisation — every reference handed
/// out by [`MetadataWriter::position`] in the meantime remains valid because it addresses a
/// logical block/byte pair, not a physical file offset.
#[derive(Debug)]
pub struct MetadataWriter {
    compressor: FilesystemCompressor,
    block_size: u32,
    /// Finished, framed blocks (length header + payload), in emission order.
    finished: Vec<u8>,
    /// Bytes buffered since the last flush.
    buffered: Vec<u8>,
    /// Byte offset, within the *finished* stream, of the start of the in-progress block.
    block_start: u32,
}

impl MetadataWriter {
    pub fn new(compressor: FilesystemCompressor, block_size: u32) -> Self {
        Self {
            compressor,
            block_size,
            finished: Vec::new(),
            buffered: Vec::new(),
            block_start: 0,
        }
    }

    /// Current logical position: where the next byte written would land.
    pub fn position(&self) -> MetadataPosition {
        (self.block_start, self.buffered.len() as u16)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let space = METADATA_MAXSIZE - self.buffered.len();
            let take = space.min(remaining.len());
            self.buffered.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buffered.len() == METADATA_MAXSIZE {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<(), Error> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let compressed =
            compressor::compress_block(&self.buffered, &self.compressor, self.block_size)?;
        let (len, payload) = match compressed {
            Some(bytes) => (bytes.len() as u16, bytes),
            None => (
                Metadata::set_if_uncompressed(self.buffered.len() as u16),
                std::mem::take(&mut self.buffered),
            ),
        };
        self.finished.write_all(&len.to_le_bytes())?;
        self.finished.write_all(&payload)?;
        self.block_start = self.finished.len() as u32;
        self.buffered.clear();
        Ok(())
    }

    /// Flushes any buffered bytes and returns the full framed byte stream for this table.
    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        self.flush_block()?;
        Ok(self.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Compressor;

    #[test]
    fn flushes_at_8192_bytes() {
        let fc = FilesystemCompressor::new(Compressor::None, None);
        let mut mw = MetadataWriter::new(fc, 0x20000);
        assert_eq!(mw.position(), (0, 0));
        mw.write(&vec![0xAB; METADATA_MAXSIZE - 3]).unwrap();
        assert_eq!(mw.position(), (0, (METADATA_MAXSIZE - 3) as u16));
        mw.write(&vec![0xCD; 6]).unwrap();
        // 3 bytes finished the first block, 3 bytes started the next
        assert_eq!(mw.position().1, 3);
        assert!(mw.position().0 > 0);
    }

    #[test]
    fn uncompressed_block_sets_top_bit() {
        let fc = FilesystemCompressor::new(Compressor::None, None);
        let mut mw = MetadataWriter::new(fc, 0x20000);
        mw.write(b"hello").unwrap();
        let bytes = mw.finish().unwrap();
        let len = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert!(!Metadata::is_compressed(len));
        assert_eq!(Metadata::len(len), 5);
        assert_eq!(&bytes[2..7], b"hello");
    }
}
