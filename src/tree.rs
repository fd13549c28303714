//! In-memory filesystem tree: accumulates decoded tar entries into a directory hierarchy, then
//! writes it out bottom-up so every child's inode exists before its parent directory is framed.
//!
//! Two passes do the writing. The first writes every non-directory leaf (files, symlinks,
//! devices, fifos, sockets) in whatever order the tar stream produced them and records each
//! one's resulting [`Entry`] by path; hardlink targets are resolved against this map, so a
//! hardlink's entry is just another lookup rather than a second inode. The second pass walks the
//! directory tree recursively: a directory's inode number is assigned on the way down (so its
//! children can record the right `parent_inode`), but its inode bytes are only written on the way
//! back up, once every child's listing entry is known.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use crate::data::{DataWriter, FileBody};
use crate::entry::{Entry, NodeMeta};
use crate::error::Error;
use crate::id::IdTable;
use crate::metadata::MetadataWriter;
use crate::xattr::{self, XattrEntry, XattrTable};

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Normal(n) => out.push(n),
            Component::ParentDir => {
                out.pop();
            },
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {},
        }
    }
    out
}

/// One decoded tar entry, fully resolved and ready to fold into the tree.
pub(crate) struct RawNode {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub permissions: u16,
    pub mtime: u32,
    pub xattrs: Vec<XattrEntry>,
    pub kind: RawKind,
}

pub(crate) enum RawKind {
    Dir,
    File(FileBody, u64),
    HardLink(PathBuf),
    Symlink(Vec<u8>),
    CharDevice(u32),
    BlockDevice(u32),
    Fifo,
    Socket,
}

#[derive(Clone)]
struct Meta {
    uid: u32,
    gid: u32,
    permissions: u16,
    mtime: u32,
    xattrs: Vec<XattrEntry>,
}

enum Child {
    Dir(DirNode),
    Leaf(PathBuf),
}

struct DirNode {
    meta: Meta,
    /// `false` for a directory that was only ever implied by some descendant's path; updated to
    /// `true` (and its metadata replaced) if an explicit tar entry for it shows up. Not currently
    /// consulted anywhere; kept for a future duplicate-declaration diagnostic.
    #[allow(dead_code)]
    explicit: bool,
    children: BTreeMap<Vec<u8>, Child>,
}

impl DirNode {
    fn implicit(defaults: &Meta) -> Self {
        Self {
            meta: defaults.clone(),
            explicit: false,
            children: BTreeMap::new(),
        }
    }
}

/// Default ownership/permissions/mtime applied to directories implied by a path but never given
/// their own tar entry (the `--defaults` CLI option).
#[derive(Clone)]
pub struct Defaults {
    pub uid: u32,
    pub gid: u32,
    pub permissions: u16,
    pub mtime: u32,
}

pub(crate) struct Tree {
    root: DirNode,
    link_targets: HashMap<PathBuf, u32>,
    // Ordered by path so inode numbering, id-table/xattr-table insertion order, and the data
    // section's byte layout are all deterministic regardless of the tar stream's record order.
    leaves: BTreeMap<PathBuf, (Meta, LeafKind)>,
}

enum LeafKind {
    File(FileBody, u64),
    Symlink(Vec<u8>),
    CharDevice(u32),
    BlockDevice(u32),
    Fifo,
    Socket,
}

impl Tree {
    pub fn build(nodes: Vec<RawNode>, defaults: &Defaults) -> Result<Self, Error> {
        let default_meta = Meta {
            uid: defaults.uid,
            gid: defaults.gid,
            permissions: defaults.permissions,
            mtime: defaults.mtime,
            xattrs: vec![],
        };

        let mut link_targets: HashMap<PathBuf, u32> = HashMap::new();
        for node in &nodes {
            if let RawKind::HardLink(target) = &node.kind {
                *link_targets.entry(normalize(target)).or_insert(0) += 1;
            }
        }

        let mut tree = Tree {
            root: DirNode::implicit(&default_meta),
            link_targets,
            leaves: BTreeMap::new(),
        };

        for node in nodes {
            let path = normalize(&node.path);
            if path.as_os_str().is_empty() {
                // the root directory itself; fold its metadata onto the implicit root
                if matches!(node.kind, RawKind::Dir) {
                    tree.root.meta = Meta {
                        uid: node.uid,
                        gid: node.gid,
                        permissions: node.permissions,
                        mtime: node.mtime,
                        xattrs: node.xattrs,
                    };
                    tree.root.explicit = true;
                }
                continue;
            }

            let meta = Meta {
                uid: node.uid,
                gid: node.gid,
                permissions: node.permissions,
                mtime: node.mtime,
                xattrs: node.xattrs,
            };

            match node.kind {
                RawKind::Dir => tree.insert_dir(&path, meta, &default_meta)?,
                RawKind::HardLink(target) => {
                    tree.insert_leaf_ref(&path, normalize(&target), &default_meta)?
                },
                RawKind::File(body, size) => {
                    tree.leaves.insert(path.clone(), (meta, LeafKind::File(body, size)));
                    tree.insert_leaf_ref(&path, path.clone(), &default_meta)?;
                },
                RawKind::Symlink(target) => {
                    tree.leaves.insert(path.clone(), (meta, LeafKind::Symlink(target)));
                    tree.insert_leaf_ref(&path, path.clone(), &default_meta)?;
                },
                RawKind::CharDevice(rdev) => {
                    tree.leaves.insert(path.clone(), (meta, LeafKind::CharDevice(rdev)));
                    tree.insert_leaf_ref(&path, path.clone(), &default_meta)?;
                },
                RawKind::BlockDevice(rdev) => {
                    tree.leaves.insert(path.clone(), (meta, LeafKind::BlockDevice(rdev)));
                    tree.insert_leaf_ref(&path, path.clone(), &default_meta)?;
                },
                RawKind::Fifo => {
                    tree.leaves.insert(path.clone(), (meta, LeafKind::Fifo));
                    tree.insert_leaf_ref(&path, path.clone(), &default_meta)?;
                },
                RawKind::Socket => {
                    tree.leaves.insert(path.clone(), (meta, LeafKind::Socket));
                    tree.insert_leaf_ref(&path, path.clone(), &default_meta)?;
                },
            }
        }

        Ok(tree)
    }

    fn dir_for_parent<'t>(
        &'t mut self,
        path: &Path,
        default_meta: &Meta,
    ) -> Result<&'t mut DirNode, Error> {
        let mut cursor = &mut self.root;
        for comp in path.components() {
            let name = match comp {
                Component::Normal(n) => n.as_bytes().to_vec(),
                _ => continue,
            };
            cursor = match cursor.children.entry(name.clone()).or_insert_with(|| {
                Child::Dir(DirNode::implicit(default_meta))
            }) {
                Child::Dir(d) => d,
                Child::Leaf(_) => {
                    return Err(Error::tree_constraint(
                        String::from_utf8_lossy(&name),
                        "path component already exists as a non-directory",
                    ))
                },
            };
        }
        Ok(cursor)
    }

    fn insert_dir(&mut self, path: &Path, meta: Meta, default_meta: &Meta) -> Result<(), Error> {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let name = path
            .file_name()
            .ok_or_else(|| Error::tree_constraint(path.display().to_string(), "directory entry has no name"))?
            .as_bytes()
            .to_vec();

        let dir = self.dir_for_parent(parent, default_meta)?;
        match dir.children.get_mut(&name) {
            Some(Child::Dir(existing)) => {
                existing.meta = meta;
                existing.explicit = true;
            },
            Some(Child::Leaf(_)) => {
                return Err(Error::tree_constraint(
                    path.display().to_string(),
                    "directory collides with an already-inserted non-directory entry",
                ))
            },
            None => {
                let mut node = DirNode::implicit(default_meta);
                node.meta = meta;
                node.explicit = true;
                dir.children.insert(name, Child::Dir(node));
            },
        }
        Ok(())
    }

    fn insert_leaf_ref(&mut self, path: &Path, target: PathBuf, default_meta: &Meta) -> Result<(), Error> {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let name = path
            .file_name()
            .ok_or_else(|| Error::tree_constraint(path.display().to_string(), "entry has no name"))?
            .as_bytes()
            .to_vec();
        let dir = self.dir_for_parent(parent, default_meta)?;
        dir.children.insert(name, Child::Leaf(target));
        Ok(())
    }

    /// Writes every leaf, then the directory tree, returning the root directory's own entry
    /// (its `(start, offset)` is the image's root inode reference) and an inode-number to
    /// inode-reference map covering every inode written, for the optional export table.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        mut self,
        id_table: &mut IdTable,
        xattr_table: &mut XattrTable,
        inode_writer: &mut MetadataWriter,
        dir_writer: &mut MetadataWriter,
        data_writer: &mut DataWriter,
        no_xattr: bool,
    ) -> Result<(u32, Entry, HashMap<u32, (u32, u16)>), Error> {
        let mut inode_counter = 0u32;
        let mut written: HashMap<PathBuf, Entry> = HashMap::new();
        let mut export_refs: HashMap<u32, (u32, u16)> = HashMap::new();

        let leaves = std::mem::take(&mut self.leaves);
        for (path, (meta, kind)) in leaves {
            inode_counter += 1;
            let link_count = 1 + self.link_targets.get(&path).copied().unwrap_or(0);
            let xattr_idx = Self::fold_xattrs(xattr_table, &meta, no_xattr);
            let node_meta = NodeMeta {
                permissions: meta.permissions,
                uid: meta.uid,
                gid: meta.gid,
                mtime: meta.mtime,
                xattr_idx,
            };
            let name = basename(&path);
            let entry = match kind {
                LeafKind::File(body, logical_size) => Entry::file(
                    &name,
                    &node_meta,
                    body,
                    logical_size,
                    inode_counter,
                    link_count,
                    data_writer,
                    id_table,
                    inode_writer,
                )?,
                LeafKind::Symlink(target) => Entry::symlink(
                    &name,
                    &node_meta,
                    &target,
                    inode_counter,
                    link_count,
                    id_table,
                    inode_writer,
                )?,
                LeafKind::CharDevice(rdev) => Entry::device(
                    &name,
                    &node_meta,
                    true,
                    rdev,
                    inode_counter,
                    link_count,
                    id_table,
                    inode_writer,
                )?,
                LeafKind::BlockDevice(rdev) => Entry::device(
                    &name,
                    &node_meta,
                    false,
                    rdev,
                    inode_counter,
                    link_count,
                    id_table,
                    inode_writer,
                )?,
                LeafKind::Fifo => Entry::ipc(
                    &name,
                    &node_meta,
                    false,
                    inode_counter,
                    link_count,
                    id_table,
                    inode_writer,
                )?,
                LeafKind::Socket => Entry::ipc(
                    &name,
                    &node_meta,
                    true,
                    inode_counter,
                    link_count,
                    id_table,
                    inode_writer,
                )?,
            };
            export_refs.insert(entry.inode, (entry.start, entry.offset));
            written.insert(path, entry);
        }

        let root = std::mem::replace(&mut self.root, DirNode::implicit(&Meta {
            uid: 0,
            gid: 0,
            permissions: 0o755,
            mtime: 0,
            xattrs: vec![],
        }));

        let root_entry = self.write_dir(
            root,
            0,
            &mut inode_counter,
            id_table,
            xattr_table,
            inode_writer,
            dir_writer,
            &written,
            &mut export_refs,
            no_xattr,
        )?;

        Ok((inode_counter, root_entry, export_refs))
    }

    fn fold_xattrs(xattr_table: &mut XattrTable, meta: &Meta, no_xattr: bool) -> Option<u32> {
        if no_xattr || meta.xattrs.is_empty() {
            return None;
        }
        xattr_table.intern(&xattr::canonicalize(meta.xattrs.clone()))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_dir(
        &self,
        dir: DirNode,
        parent_inode: u32,
        inode_counter: &mut u32,
        id_table: &mut IdTable,
        xattr_table: &mut XattrTable,
        inode_writer: &mut MetadataWriter,
        dir_writer: &mut MetadataWriter,
        written: &HashMap<PathBuf, Entry>,
        export_refs: &mut HashMap<u32, (u32, u16)>,
        no_xattr: bool,
    ) -> Result<Entry, Error> {
        // Post-order: a directory's own inode number is the highest number in its subtree, since
        // every child (file or directory) is numbered before it. The number is computed up front
        // from the subtree's directory count so it can be handed to children as their
        // `parent_inode` before they are visited; `inode_counter` only catches up to it once the
        // recursion below has actually consumed every child's number.
        let this_inode = *inode_counter + count_dirs(&dir);

        let mut subdir_count = 0u32;
        let mut child_entries = Vec::with_capacity(dir.children.len());

        for (name, child) in dir.children {
            match child {
                Child::Dir(sub) => {
                    subdir_count += 1;
                    let entry = self.write_dir(
                        sub,
                        this_inode,
                        inode_counter,
                        id_table,
                        xattr_table,
                        inode_writer,
                        dir_writer,
                        written,
                        export_refs,
                        no_xattr,
                    )?;
                    child_entries.push(Entry::hardlink(&name, &entry));
                },
                Child::Leaf(target) => {
                    let resolved = written.get(&target).ok_or_else(|| {
                        Error::tree_constraint(
                            target.display().to_string(),
                            "hardlink target has no corresponding inode",
                        )
                    })?;
                    child_entries.push(Entry::hardlink(&name, resolved));
                },
            }
        }

        *inode_counter += 1;
        debug_assert_eq!(*inode_counter, this_inode, "post-order numbering invariant violated");

        let (block_index, block_offset) = dir_writer.position();
        let mut total_size = 3u32;
        for chunk in Entry::into_dir(child_entries)? {
            let bytes = chunk_to_bytes(&chunk)?;
            total_size += bytes.len() as u32;
            dir_writer.write(&bytes)?;
        }

        let link_count = 2 + subdir_count;
        let xattr_idx = Self::fold_xattrs(xattr_table, &dir.meta, no_xattr);
        let node_meta = NodeMeta {
            permissions: dir.meta.permissions,
            uid: dir.meta.uid,
            gid: dir.meta.gid,
            mtime: dir.meta.mtime,
            xattr_idx,
        };

        let entry = Entry::dir(
            &[],
            &node_meta,
            this_inode,
            parent_inode,
            link_count,
            block_index,
            block_offset,
            total_size,
            id_table,
            inode_writer,
        )?;
        export_refs.insert(entry.inode, (entry.start, entry.offset));
        Ok(entry)
    }
}

/// Number of directories in the subtree rooted at `dir`, itself included. Lets a directory learn
/// its own post-order inode number before visiting its children.
fn count_dirs(dir: &DirNode) -> u32 {
    1 + dir
        .children
        .values()
        .filter_map(|child| match child {
            Child::Dir(sub) => Some(count_dirs(sub)),
            Child::Leaf(_) => None,
        })
        .sum::<u32>()
}

fn chunk_to_bytes(dir: &crate::dir::Dir) -> Result<Vec<u8>, Error> {
    use deku::DekuContainerWrite;
    dir.to_bytes()
        .map_err(|e| Error::Compression(format!("directory listing serialisation failed: {e}")))
}

fn basename(path: &Path) -> Vec<u8> {
    path.file_name()
        .map(|n| n.as_bytes().to_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Defaults {
        Defaults {
            uid: 0,
            gid: 0,
            permissions: 0o755,
            mtime: 0,
        }
    }

    #[test]
    fn implicit_parent_dirs_are_created() {
        let nodes = vec![RawNode {
            path: PathBuf::from("a/b/c.txt"),
            uid: 1,
            gid: 1,
            permissions: 0o644,
            mtime: 0,
            xattrs: vec![],
            kind: RawKind::File(FileBody::Dense(b"hi".to_vec()), 2),
        }];
        let tree = Tree::build(nodes, &defaults()).unwrap();
        assert!(tree.root.children.contains_key(b"a".as_slice()));
    }

    fn leaf(path: &str, kind: RawKind) -> RawNode {
        RawNode {
            path: PathBuf::from(path),
            uid: 0,
            gid: 0,
            permissions: 0o644,
            mtime: 0,
            xattrs: vec![],
            kind,
        }
    }

    #[test]
    fn hardlink_reuses_targets_inode_and_bumps_no_new_number() {
        use crate::compressor::{Compressor, FilesystemCompressor};
        use crate::data::DataWriter;
        use crate::metadata::MetadataWriter;

        let nodes = vec![
            leaf("a.txt", RawKind::File(FileBody::Dense(b"hello".to_vec()), 5)),
            leaf("link.txt", RawKind::HardLink(PathBuf::from("a.txt"))),
        ];
        let tree = Tree::build(nodes, &defaults()).unwrap();

        let fc = FilesystemCompressor::new(Compressor::None, None);
        let mut id_table = IdTable::new();
        let mut xattr_table = XattrTable::new();
        let mut inode_writer = MetadataWriter::new(fc, 0x20000);
        let mut dir_writer = MetadataWriter::new(fc, 0x20000);
        let mut data_writer = DataWriter::new(fc, 0, 0x20000, 1, 4);

        let (total_inodes, root_entry, _export_refs) = tree
            .write(
                &mut id_table,
                &mut xattr_table,
                &mut inode_writer,
                &mut dir_writer,
                &mut data_writer,
                false,
            )
            .unwrap();

        // one inode for the file plus one for the root directory; the hardlink shares the file's
        assert_eq!(total_inodes, 2);
        assert_eq!(root_entry.inode, 2);
    }

    #[test]
    fn forward_referencing_hardlink_is_an_error() {
        use crate::compressor::{Compressor, FilesystemCompressor};
        use crate::data::DataWriter;
        use crate::metadata::MetadataWriter;

        let nodes = vec![leaf("link.txt", RawKind::HardLink(PathBuf::from("missing.txt")))];
        let tree = Tree::build(nodes, &defaults()).unwrap();

        let fc = FilesystemCompressor::new(Compressor::None, None);
        let mut id_table = IdTable::new();
        let mut xattr_table = XattrTable::new();
        let mut inode_writer = MetadataWriter::new(fc, 0x20000);
        let mut dir_writer = MetadataWriter::new(fc, 0x20000);
        let mut data_writer = DataWriter::new(fc, 0, 0x20000, 1, 4);

        let result = tree.write(
            &mut id_table,
            &mut xattr_table,
            &mut inode_writer,
            &mut dir_writer,
            &mut data_writer,
            false,
        );
        assert!(result.is_err());
    }
}
