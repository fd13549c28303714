//! The "table of metadata blocks plus an index" layout shared by the fragment, export,
//! identifier, and xattr-id tables: fixed-size records are packed into compressed 8-KiB metadata
//! blocks, and a trailing array of little-endian `u64` block-start offsets — the table's index —
//! is what the superblock actually points at.

use std::io::Write;

use crate::compressor::{self, FilesystemCompressor};
use crate::error::Error;
use crate::metadata::{Metadata, METADATA_MAXSIZE};

/// Packs `records` (each already serialised to the same fixed width) into compressed metadata
/// blocks appended to `sink`, then appends the block-start index. Returns the index's offset,
/// which is the value a superblock table field stores. `sink` positions are relative to
/// `base_offset`, the image offset at which `sink`'s first byte will eventually land.
pub(crate) fn write_table(
    sink: &mut Vec<u8>,
    base_offset: u64,
    compressor: &FilesystemCompressor,
    block_size: u32,
    records: &[Vec<u8>],
) -> Result<u64, Error> {
    if records.is_empty() {
        return Ok(base_offset + sink.len() as u64);
    }

    let record_len = records[0].len();
    let per_block = (METADATA_MAXSIZE / record_len).max(1);

    let mut block_starts = Vec::new();
    for chunk in records.chunks(per_block) {
        block_starts.push(base_offset + sink.len() as u64);

        let mut payload = Vec::with_capacity(chunk.len() * record_len);
        for record in chunk {
            payload.extend_from_slice(record);
        }

        let (len, bytes) = match compressor::compress_block(&payload, compressor, block_size)? {
            Some(compressed) => (compressed.len() as u16, compressed),
            None => (
                Metadata::set_if_uncompressed(payload.len() as u16),
                payload,
            ),
        };
        sink.write_all(&len.to_le_bytes())?;
        sink.write_all(&bytes)?;
    }

    let index_offset = base_offset + sink.len() as u64;
    for start in block_starts {
        sink.write_all(&start.to_le_bytes())?;
    }
    Ok(index_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Compressor;

    #[test]
    fn empty_table_index_is_current_offset() {
        let mut sink = Vec::new();
        let fc = FilesystemCompressor::new(Compressor::None, None);
        let offset = write_table(&mut sink, 100, &fc, 0x20000, &[]).unwrap();
        assert_eq!(offset, 100);
        assert!(sink.is_empty());
    }

    #[test]
    fn packs_many_small_records_into_one_block() {
        let mut sink = Vec::new();
        let fc = FilesystemCompressor::new(Compressor::None, None);
        let records: Vec<Vec<u8>> = (0u32..100).map(|n| n.to_le_bytes().to_vec()).collect();
        let index_offset = write_table(&mut sink, 0, &fc, 0x20000, &records).unwrap();
        // one block (2-byte length header + 400 bytes of payload), then the index
        assert_eq!(index_offset, 2 + 400);
        let block_start = u64::from_le_bytes(sink[index_offset as usize..index_offset as usize + 8].try_into().unwrap());
        assert_eq!(block_start, 0);
    }
}
