//! [`Entry`]: the (directory-table-reference, inode) pair produced for every tree node, and
//! [`Entry::into_dir`], which groups a directory's entries into the size-bounded [`Dir`] chunks
//! that actually get written.

use std::fmt;

use tracing::instrument;

use crate::data::{Added, DataWriter, FileBody};
use crate::dir::{Dir, DirEntry};
use crate::error::Error;
use crate::id::IdTable;
use crate::inode::{
    Device, Directory, File, Inode, InodeHeader, InodeId, InodeInner, Ipc, Symlink,
};
use crate::metadata::MetadataWriter;

/// Common, already-resolved metadata every node carries: ownership, permissions, timestamp, and
/// its folded xattr-table index (if any).
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeMeta {
    pub permissions: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub xattr_idx: Option<u32>,
}

impl NodeMeta {
    fn header(&self, inode_number: u32, id_table: &mut IdTable) -> InodeHeader {
        InodeHeader {
            permissions: self.permissions,
            uid_idx: id_table.id_to_index(self.uid),
            gid_idx: id_table.id_to_index(self.gid),
            mtime: self.mtime,
            inode_number,
        }
    }

    fn xattr_idx(&self) -> u32 {
        self.xattr_idx.unwrap_or(0xffff_ffff)
    }
}

/// One directory-entry-to-be: a pointer at an already-serialised inode, plus the name under
/// which its parent directory will list it.
#[derive(Clone)]
pub(crate) struct Entry {
    pub start: u32,
    pub offset: u16,
    pub inode: u32,
    pub t: InodeId,
    pub name: Vec<u8>,
}

impl Entry {
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).to_string()
    }

    fn write_inode(
        inode: &Inode,
        name: &[u8],
        inode_writer: &mut MetadataWriter,
    ) -> Result<Entry, Error> {
        let (block_start, byte_offset) = inode_writer.position();
        let bytes = inode.to_bytes()?;
        inode_writer.write(&bytes)?;
        Ok(Entry {
            start: block_start,
            offset: byte_offset,
            inode: inode.header.inode_number,
            t: inode.id,
            name: name.to_vec(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn dir(
        name: &[u8],
        meta: &NodeMeta,
        inode_number: u32,
        parent_inode: u32,
        link_count: u32,
        block_index: u32,
        block_offset: u16,
        file_size: u32,
        id_table: &mut IdTable,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Entry, Error> {
        let inode = Inode {
            id: InodeId::Directory,
            header: meta.header(inode_number, id_table),
            inner: InodeInner::Directory(Directory {
                link_count,
                file_size,
                block_index,
                parent_inode,
                index_count: 0,
                block_offset,
                xattr_idx: meta.xattr_idx(),
            }),
        };
        Self::write_inode(&inode, name, inode_writer)
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(meta, data_writer, id_table, inode_writer))]
    pub fn file(
        name: &[u8],
        meta: &NodeMeta,
        body: FileBody,
        logical_size: u64,
        inode_number: u32,
        link_count: u32,
        data_writer: &mut DataWriter,
        id_table: &mut IdTable,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Entry, Error> {
        let added = data_writer.add_file(body)?;

        let file_inner = match added {
            Added::Data {
                blocks_start,
                block_sizes,
                tail,
            } => {
                let (frag_index, block_offset) = tail.unwrap_or((0xffff_ffff, 0));
                File {
                    blocks_start,
                    file_size: logical_size,
                    sparse: logical_size,
                    link_count,
                    frag_index,
                    block_offset,
                    xattr_idx: meta.xattr_idx(),
                    block_sizes,
                }
            },
            Added::Fragment {
                frag_index,
                block_offset,
            } => File {
                blocks_start: 0,
                file_size: logical_size,
                sparse: logical_size,
                link_count,
                frag_index,
                block_offset,
                xattr_idx: meta.xattr_idx(),
                block_sizes: vec![],
            },
        };

        let inode = Inode {
            id: InodeId::File,
            header: meta.header(inode_number, id_table),
            inner: InodeInner::File(file_inner),
        };
        Self::write_inode(&inode, name, inode_writer)
    }

    /// Writes a hardlink's directory entry: reuses an already-written inode's type and payload
    /// reference. The target's own write already accounted for this link in its `link_count`.
    pub fn hardlink(name: &[u8], target: &Entry) -> Entry {
        Entry {
            start: target.start,
            offset: target.offset,
            inode: target.inode,
            t: target.t,
            name: name.to_vec(),
        }
    }

    pub fn symlink(
        name: &[u8],
        meta: &NodeMeta,
        target: &[u8],
        inode_number: u32,
        link_count: u32,
        id_table: &mut IdTable,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Entry, Error> {
        let inode = Inode {
            id: InodeId::Symlink,
            header: meta.header(inode_number, id_table),
            inner: InodeInner::Symlink(Symlink {
                link_count,
                target_size: target.len() as u32,
                target_path: target.to_vec(),
                xattr_idx: meta.xattr_idx(),
            }),
        };
        Self::write_inode(&inode, name, inode_writer)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn device(
        name: &[u8],
        meta: &NodeMeta,
        char: bool,
        device_number: u32,
        inode_number: u32,
        link_count: u32,
        id_table: &mut IdTable,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Entry, Error> {
        let id = if char {
            InodeId::CharDevice
        } else {
            InodeId::BlockDevice
        };
        let inner = Device {
            link_count,
            device_number,
            xattr_idx: meta.xattr_idx(),
        };
        let inode = Inode {
            id,
            header: meta.header(inode_number, id_table),
            inner: if char {
                InodeInner::CharDevice(inner)
            } else {
                InodeInner::BlockDevice(inner)
            },
        };
        Self::write_inode(&inode, name, inode_writer)
    }

    pub fn ipc(
        name: &[u8],
        meta: &NodeMeta,
        socket: bool,
        inode_number: u32,
        link_count: u32,
        id_table: &mut IdTable,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Entry, Error> {
        let id = if socket {
            InodeId::Socket
        } else {
            InodeId::Fifo
        };
        let inner = Ipc {
            link_count,
            xattr_idx: meta.xattr_idx(),
        };
        let inode = Inode {
            id,
            header: meta.header(inode_number, id_table),
            inner: if socket {
                InodeInner::Socket(inner)
            } else {
                InodeInner::Fifo(inner)
            },
        };
        Self::write_inode(&inode, name, inode_writer)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("start", &self.start)
            .field("offset", &self.offset)
            .field("inode", &self.inode)
            .field("t", &self.t)
            .field("name", &self.name())
            .finish()
    }
}

impl Entry {
    fn create_dir(creating_dir: &[&Entry], start: u32) -> Result<Dir, Error> {
        let lowest_inode = creating_dir
            .iter()
            .map(|e| e.inode)
            .min()
            .ok_or_else(|| Error::internal("create_dir called with no entries"))?;

        let count = creating_dir.len() as u32;
        if count >= 256 {
            return Err(Error::internal(
                "directory chunk exceeded 256 entries before emission",
            ));
        }

        let dir_entries = creating_dir
            .iter()
            .map(|e| DirEntry {
                offset: e.offset,
                inode_offset: (e.inode as i64 - lowest_inode as i64) as i16,
                t: e.t as u16,
                name_size: (e.name.len().max(1) - 1) as u16,
                name: e.name.clone(),
            })
            .collect();

        Ok(Dir {
            count: count - 1,
            start,
            inode_num: lowest_inode,
            dir_entries,
        })
    }

    /// Groups a directory's entries, sorted by name, into chunks of at most 256 entries, never
    /// letting a chunk straddle a change in `start` (the metadata block an entry's inode lives
    /// in, since `inode_offset` is only 16 bits wide relative to the chunk's lowest inode).
    #[instrument(skip_all)]
    pub(crate) fn into_dir(mut entries: Vec<Entry>) -> Result<Vec<Dir>, Error> {
        if entries.is_empty() {
            return Ok(vec![]);
        }
        entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        let mut dirs = vec![];
        let mut creating_dir: Vec<&Entry> = vec![];
        let mut creating_start = entries[0].start;
        let mut iter = entries.iter().peekable();

        while let Some(e) = iter.next() {
            creating_dir.push(e);
            let at_boundary = match iter.peek() {
                Some(next) => next.start != creating_start || creating_dir.len() >= 255,
                None => true,
            };
            if at_boundary {
                dirs.push(Self::create_dir(&creating_dir, creating_start)?);
                creating_dir = vec![];
                if let Some(next) = iter.peek() {
                    creating_start = next.start;
                }
            }
        }

        Ok(dirs)
    }
}
