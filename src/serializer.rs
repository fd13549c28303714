//! Orchestrates one end-to-end run: decode the incoming tar stream, fold it into a filesystem
//! tree, drive the data/metadata writers, and assemble the finished image in the exact section
//! order `tar2sqfs.c`'s `main()` lays one out in.

use std::io::Read;
use std::path::Path;

use deku::DekuContainerWrite;
use tracing::info;

use crate::compressor::FilesystemCompressor;
use crate::config::Config;
use crate::data::DataWriter;
use crate::error::Error;
use crate::id::IdTable;
use crate::metadata::MetadataWriter;
use crate::sink::{persist, ByteSink, MemorySink};
use crate::superblock::{Flags, SuperBlock};
use crate::table::write_table;
use crate::tar;
use crate::tree::Tree;
use crate::xattr::{self, XattrTable};

fn round_up(value: u64, multiple: u64) -> u64 {
    let rem = value % multiple;
    if rem == 0 {
        value
    } else {
        value + (multiple - rem)
    }
}

fn inode_ref(block: u32, offset: u16) -> u64 {
    (u64::from(block) << 16) | u64::from(offset)
}

/// Reads a tar stream from `input`, builds a SquashFS image per `config`, and persists it to
/// `output_path`.
pub fn run(config: &Config, input: &mut dyn Read, output_path: &Path) -> Result<(), Error> {
    config.validate()?;

    let fc = FilesystemCompressor {
        id: config.compressor,
        options: config.compression_options,
        extra: config.comp_extra,
    };

    let mut nodes = tar::decode(input, config.no_skip, config.block_size)?;
    if !config.keep_time {
        for node in &mut nodes {
            node.mtime = config.defaults.mtime;
        }
    }
    if config.no_xattr {
        for node in &mut nodes {
            node.xattrs.clear();
        }
    }
    info!(entries = nodes.len(), "decoded tar stream");

    let tree = Tree::build(nodes, &config.defaults)?;

    // Section 1: data blocks/fragments start right after the fixed 96-byte superblock; this
    // build never emits an on-disk compression-options block (see DESIGN.md).
    let data_start = SuperBlock::SIZE as u64;

    let mut id_table = IdTable::new();
    let mut xattr_table = XattrTable::new();
    let mut inode_writer = MetadataWriter::new(fc, config.block_size);
    let mut dir_writer = MetadataWriter::new(fc, config.block_size);
    let mut data_writer = DataWriter::new(
        fc,
        data_start,
        config.block_size,
        config.num_jobs,
        config.effective_backlog(),
    );

    let (inode_count, root_entry, export_refs) = tree.write(
        &mut id_table,
        &mut xattr_table,
        &mut inode_writer,
        &mut dir_writer,
        &mut data_writer,
        config.no_xattr,
    )?;
    info!(inode_count, "tree serialised");

    data_writer.finalize()?;
    let (data_bytes, fragment_table) = data_writer.into_parts();

    let mut sb = SuperBlock::new(config.compressor, config.block_size);
    sb.inode_count = inode_count;
    sb.root_inode = inode_ref(root_entry.start, root_entry.offset);
    if config.exportable {
        sb.set_flag(Flags::NFSExportTableExists);
    }
    if xattr_table.is_empty() {
        sb.set_flag(Flags::NoXattrsInArchive);
    }

    let mut sink = MemorySink::new();
    sink.write_at(data_start, &data_bytes)?;
    let mut offset = data_start + data_bytes.len() as u64;

    sb.inode_table = offset;
    let inode_bytes = inode_writer.finish()?;
    sink.write_at(offset, &inode_bytes)?;
    offset += inode_bytes.len() as u64;

    sb.dir_table = offset;
    let dir_bytes = dir_writer.finish()?;
    sink.write_at(offset, &dir_bytes)?;
    offset += dir_bytes.len() as u64;

    sb.frag_count = fragment_table.len() as u32;
    let frag_records = fragment_table
        .iter()
        .map(|f| {
            f.to_bytes()
                .map_err(|e| Error::Compression(format!("fragment entry serialisation failed: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut frag_section = Vec::new();
    sb.frag_table = write_table(&mut frag_section, offset, &fc, config.block_size, &frag_records)?;
    sink.write_at(offset, &frag_section)?;
    offset += frag_section.len() as u64;

    if config.exportable {
        let mut export_records = Vec::with_capacity(inode_count as usize);
        for inode_number in 1..=inode_count {
            let (start, byte_offset) = export_refs.get(&inode_number).copied().ok_or_else(|| {
                Error::internal_at(inode_number, "inode missing from export-reference map")
            })?;
            export_records.push(inode_ref(start, byte_offset).to_le_bytes().to_vec());
        }
        let mut export_section = Vec::new();
        sb.export_table =
            write_table(&mut export_section, offset, &fc, config.block_size, &export_records)?;
        sink.write_at(offset, &export_section)?;
        offset += export_section.len() as u64;
    }

    sb.id_count = id_table.len() as u16;
    let id_records = id_table
        .as_entries()
        .iter()
        .map(|id| id.num.to_le_bytes().to_vec())
        .collect::<Vec<_>>();
    let mut id_section = Vec::new();
    sb.id_table = write_table(&mut id_section, offset, &fc, config.block_size, &id_records)?;
    sink.write_at(offset, &id_section)?;
    offset += id_section.len() as u64;

    if !xattr_table.is_empty() {
        let (kv_bytes, id_entries) = xattr::build_xattr_tables(&xattr_table, fc, config.block_size)?;
        sink.write_at(offset, &kv_bytes)?;
        let kv_start = offset;
        offset += kv_bytes.len() as u64;

        let mut xattr_id_section = Vec::new();
        write_table(&mut xattr_id_section, offset, &fc, config.block_size, &id_entries)?;
        sink.write_at(offset, &xattr_id_section)?;
        offset += xattr_id_section.len() as u64;

        let header = xattr::XattrIdTableHeader {
            xattr_table_start: kv_start,
            xattr_ids: id_entries.len() as u32,
            unused: 0,
        };
        let header_bytes = header
            .to_bytes()
            .map_err(|e| Error::Compression(format!("xattr table header serialisation failed: {e}")))?;
        sb.xattr_table = offset;
        sink.write_at(offset, &header_bytes)?;
        offset += header_bytes.len() as u64;
    }

    sb.bytes_used = offset;
    let sb_bytes = sb
        .to_bytes()
        .map_err(|e| Error::Compression(format!("superblock serialisation failed: {e}")))?;
    sink.write_at(0, &sb_bytes)?;

    let padded = round_up(sink.size(), u64::from(config.dev_block_size));
    sink.pad_to(padded)?;

    persist(output_path, &sink.into_bytes(), config.force)
}
