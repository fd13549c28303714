//! Shared helpers for building in-memory tar fixtures.

use std::io::Write;

use tar::{Builder, Header};

pub fn empty_tar() -> Vec<u8> {
    let buf = Vec::new();
    let mut builder = Builder::new(buf);
    builder.finish().unwrap();
    builder.into_inner().unwrap()
}

pub fn file_header(path: &str, contents: &[u8], mtime: u64, mode: u32) -> (Header, Vec<u8>) {
    let mut header = Header::new_ustar();
    header.set_path(path).unwrap();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    (header, contents.to_vec())
}

/// Builds a tar stream from `(path, contents)` pairs, each a regular file with mode 0o644 and a
/// fixed mtime so archives built from the same input are byte-identical across runs.
pub fn tar_with_files(files: &[(&str, &[u8])]) -> Vec<u8> {
    let buf = Vec::new();
    let mut builder = Builder::new(buf);
    for (path, contents) in files {
        let (header, data) = file_header(path, contents, 1_700_000_000, 0o644);
        builder.append(&header, &data[..]).unwrap();
    }
    builder.finish().unwrap();
    builder.into_inner().unwrap()
}

/// Builds one PAX extended-header record: `"<len> <key>=<value>\n"`, where `<len>` includes its
/// own digit width (the classic fixed-point algorithm every PAX writer uses).
fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let mut len = key.len() + value.len() + 3;
    loop {
        let candidate = format!("{len} {key}=").into_bytes().len() + value.len() + 1;
        if candidate == len {
            let mut rec = format!("{len} {key}=").into_bytes();
            rec.extend_from_slice(value);
            rec.push(b'\n');
            return rec;
        }
        len = candidate;
    }
}

/// Builds `count` regular files, each preceded by its own PAX extended header carrying a single
/// `SCHILY.xattr.<key>=<value>` record, so every file gets the identical extended attribute.
pub fn tar_with_shared_xattr(count: usize, key: &str, value: &[u8]) -> Vec<u8> {
    let buf = Vec::new();
    let mut builder = Builder::new(buf);
    let pax_key = format!("SCHILY.xattr.{key}");
    for i in 0..count {
        let body = pax_record(&pax_key, value);
        let mut xheader = Header::new_ustar();
        xheader.set_entry_type(tar::EntryType::XHeader);
        xheader.set_size(body.len() as u64);
        xheader.set_cksum();
        builder.append(&xheader, &body[..]).unwrap();

        let path = format!("file{i:04}.txt");
        let (header, data) = file_header(&path, b"x", 1_700_000_000, 0o644);
        builder.append(&header, &data[..]).unwrap();
    }
    builder.finish().unwrap();
    builder.into_inner().unwrap()
}

/// Builds a tar stream where `link_path` is a hardlink to `target_path`.
pub fn tar_with_hardlink(target_path: &str, contents: &[u8], link_path: &str) -> Vec<u8> {
    let buf = Vec::new();
    let mut builder = Builder::new(buf);

    let (header, data) = file_header(target_path, contents, 1_700_000_000, 0o644);
    builder.append(&header, &data[..]).unwrap();

    let mut link_header = Header::new_ustar();
    link_header.set_entry_type(tar::EntryType::Link);
    link_header.set_path(link_path).unwrap();
    link_header.set_link_name(target_path).unwrap();
    link_header.set_size(0);
    link_header.set_mode(0o644);
    link_header.set_mtime(1_700_000_000);
    link_header.set_cksum();
    builder.append(&link_header, &[][..]).unwrap();

    builder.finish().unwrap();
    builder.into_inner().unwrap()
}

pub struct SuperBlockFields {
    pub magic: u32,
    pub inode_count: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub flags: u16,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub bytes_used: u64,
}

/// Reads the fixed 96-byte superblock fields this crate's wire layout defines, without pulling
/// in the (private) `deku`-derived struct: offsets are stable per the SquashFS 4.0 layout.
pub fn read_superblock(image: &[u8]) -> SuperBlockFields {
    let u32_at = |o: usize| u32::from_le_bytes(image[o..o + 4].try_into().unwrap());
    let u16_at = |o: usize| u16::from_le_bytes(image[o..o + 2].try_into().unwrap());
    let u64_at = |o: usize| u64::from_le_bytes(image[o..o + 8].try_into().unwrap());

    SuperBlockFields {
        magic: u32_at(0),
        inode_count: u32_at(4),
        block_size: u32_at(12),
        frag_count: u32_at(16),
        flags: u16_at(24),
        id_count: u16_at(26),
        version_major: u16_at(28),
        version_minor: u16_at(30),
        bytes_used: u64_at(40),
    }
}

#[allow(dead_code)]
pub fn write_tar_to(path: &std::path::Path, bytes: &[u8]) {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(bytes).unwrap();
}
