//! Inode: per-node on-disk metadata (type, permissions, owner, and type-specific payload).
//!
//! Every inode here is the "extended" squashfs variant (tags 8..=14): the basic variants that
//! squashfs-tools uses as a space optimisation for the common case are dropped in favour of a
//! single code path that always carries an `xattr_idx`, since this pipeline always has the xattr
//! table available and the handful of extra bytes per inode is immaterial next to the rest of the
//! image. `uid`/`gid` are stored as dense indices into the identifier table, not raw values —
//! this matches how the reference serialiser resolves ids before writing an inode, not how the
//! inode struct used to be modeled here.
//!
//! This module only ever writes inodes, never parses them back: a file's block-size list is
//! exactly as long as the [`crate::data::DataWriter`] that produced it says it is, so there is no
//! need to thread `block_size`/`block_log` through deku's read-side `count` machinery the way a
//! full reader would.

use core::fmt;

use deku::prelude::*;

use crate::data::DataSize;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub id: InodeId,
    pub header: InodeHeader,
    pub inner: InodeInner,
}

impl Inode {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = self
            .id
            .to_bytes()
            .map_err(|e| Error::Compression(format!("inode tag serialisation failed: {e}")))?;
        out.extend(
            self.header
                .to_bytes()
                .map_err(|e| Error::Compression(format!("inode header serialisation failed: {e}")))?,
        );
        out.extend(self.inner.to_bytes()?);
        Ok(out)
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(type = "u16")]
#[deku(endian = "little")]
#[rustfmt::skip]
pub enum InodeId {
    Directory    = 8,
    File         = 9,
    Symlink      = 10,
    BlockDevice  = 11,
    CharDevice   = 12,
    Fifo         = 13,
    Socket       = 14,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeInner {
    Directory(Directory),
    File(File),
    Symlink(Symlink),
    BlockDevice(Device),
    CharDevice(Device),
    Fifo(Ipc),
    Socket(Ipc),
}

impl InodeInner {
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let err = |e: deku::DekuError| Error::Compression(format!("inode body serialisation failed: {e}"));
        match self {
            InodeInner::Directory(d) => d.to_bytes().map_err(err),
            InodeInner::File(f) => f.to_bytes(),
            InodeInner::Symlink(s) => s.to_bytes().map_err(err),
            InodeInner::BlockDevice(d) | InodeInner::CharDevice(d) => d.to_bytes().map_err(err),
            InodeInner::Fifo(i) | InodeInner::Socket(i) => i.to_bytes().map_err(err),
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct InodeHeader {
    pub permissions: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Directory {
    pub link_count: u32,
    pub file_size: u32,
    pub block_index: u32,
    pub parent_inode: u32,
    pub index_count: u16,
    pub block_offset: u16,
    pub xattr_idx: u32,
}

/// A file's inode. `sparse` is the logical size (`>=` the sum of materialised bytes); equal to
/// `file_size` for a non-sparse file. `block_sizes` holds one [`DataSize`] per block-list entry,
/// in order, including zero-valued sparse-hole markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub xattr_idx: u32,
    pub block_sizes: Vec<DataSize>,
}

impl File {
    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend(self.blocks_start.to_le_bytes());
        out.extend(self.file_size.to_le_bytes());
        out.extend(self.sparse.to_le_bytes());
        out.extend(self.link_count.to_le_bytes());
        out.extend(self.frag_index.to_le_bytes());
        out.extend(self.block_offset.to_le_bytes());
        out.extend(self.xattr_idx.to_le_bytes());
        for size in &self.block_sizes {
            out.extend(
                size.to_bytes()
                    .map_err(|e| Error::Compression(format!("block size serialisation failed: {e}")))?,
            );
        }
        Ok(out)
    }
}

/// Number of block-list entries (materialised blocks plus sparse-hole markers) a file's inode
/// carries, derived from its logical size. Used to cross-check [`File::block_sizes`]'s length,
/// not to parse it.
pub fn block_count(block_size: u32, block_log: u16, fragment: u32, logical_size: u64) -> u64 {
    const NO_FRAGMENT: u32 = 0xffff_ffff;

    if fragment == NO_FRAGMENT {
        (logical_size + u64::from(block_size) - 1) >> block_log
    } else {
        logical_size >> block_log
    }
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Symlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(count = "target_size")]
    pub target_path: Vec<u8>,
    pub xattr_idx: u32,
}

impl fmt::Debug for Symlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symlink")
            .field("link_count", &self.link_count)
            .field("target", &String::from_utf8_lossy(&self.target_path))
            .field("xattr_idx", &self.xattr_idx)
            .finish()
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Device {
    pub link_count: u32,
    pub device_number: u32,
    pub xattr_idx: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Ipc {
    pub link_count: u32,
    pub xattr_idx: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_whole_blocks_when_fragmented() {
        // one full block plus a fragmented tail: only the full block appears in the list
        assert_eq!(block_count(0x20000, 17, 3, 0x20000 + 10), 1);
    }

    #[test]
    fn block_count_rounds_up_without_fragment() {
        assert_eq!(block_count(0x20000, 17, 0xffff_ffff, 0x20000 + 10), 2);
    }

    #[test]
    fn sparse_fixture_block_count() {
        // from the canonical sparse test fixture: 2,097,152 byte logical size, 32768-byte blocks
        assert_eq!(block_count(32768, 15, 0xffff_ffff, 2_097_152), 64);
    }

    #[test]
    fn symlink_round_trips() {
        let sym = Symlink {
            link_count: 1,
            target_size: 4,
            target_path: b"/abc".to_vec(),
            xattr_idx: 0xffff_ffff,
        };
        let bytes = sym.to_bytes().unwrap();
        let (_, back) = Symlink::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(sym, back);
    }
}
