//! Xattr table: deduplicates (key, value) lists into a shared xattr-index table.
//!
//! Modeled on the three-array layout the reference tool's xattr writer builds (a deduplicated key
//! pool, a deduplicated value pool, and per-node reference lists), folded down here into
//! dedup-by-content-hash the way [`crate::tree`]'s inode-numbering pass folds identical xattr
//! lists onto one index.

use std::collections::HashMap;

use deku::prelude::*;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::compressor::FilesystemCompressor;
use crate::error::Error;
use crate::metadata::MetadataWriter;

/// Known xattr namespaces; anything else is dropped (warn, or fatal under `no-skip`).
const KNOWN_PREFIXES: &[(&str, u16)] = &[("user.", 0), ("trusted.", 1), ("security.", 2)];

pub fn has_supported_prefix(key: &str) -> bool {
    KNOWN_PREFIXES.iter().any(|(p, _)| key.starts_with(p))
}

fn split_prefix(key: &str) -> Result<(u16, &str), Error> {
    KNOWN_PREFIXES
        .iter()
        .find_map(|(p, code)| key.strip_prefix(p).map(|suffix| (*code, suffix)))
        .ok_or_else(|| Error::internal("xattr key reached serialisation with an unknown namespace"))
}

/// A single attached (key, value) pair before canonicalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Canonicalises a node's raw xattr list: sort by key, merge duplicates last-write-wins.
pub fn canonicalize(mut entries: Vec<XattrEntry>) -> Vec<XattrEntry> {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    let mut merged: Vec<XattrEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(last) = merged.last_mut() {
            if last.key == entry.key {
                *last = entry;
                continue;
            }
        }
        merged.push(entry);
    }
    merged
}

fn hash_list(list: &[XattrEntry]) -> u64 {
    let mut hasher = FxHasher::default();
    for entry in list {
        entry.key.hash(&mut hasher);
        entry.value.hash(&mut hasher);
    }
    hasher.finish()
}

/// Owns the deduplicated key/value pools and the set of distinct (canonical) lists seen so far.
#[derive(Debug, Default)]
pub struct XattrTable {
    keys: Vec<String>,
    values: Vec<Vec<u8>>,
    /// Canonical lists, in first-seen order; each entry is (key_ref, value_ref) pairs.
    lists: Vec<Vec<(u32, u32)>>,
    /// content hash -> index into `lists`, for dedup.
    by_hash: HashMap<u64, Vec<u32>>,
}

impl XattrTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_ref(&mut self, key: &str) -> u32 {
        if let Some(pos) = self.keys.iter().position(|k| k == key) {
            return pos as u32;
        }
        self.keys.push(key.to_string());
        (self.keys.len() - 1) as u32
    }

    fn value_ref(&mut self, value: &[u8]) -> u32 {
        if let Some(pos) = self.values.iter().position(|v| v.as_slice() == value) {
            return pos as u32;
        }
        self.values.push(value.to_vec());
        (self.values.len() - 1) as u32
    }

    /// Folds a node's canonical xattr list onto a shared index, returning that index.
    /// Returns `None` for an empty list (no xattr-index is attached to the node in that case).
    pub fn intern(&mut self, entries: &[XattrEntry]) -> Option<u32> {
        if entries.is_empty() {
            return None;
        }
        let hash = hash_list(entries);
        let refs: Vec<(u32, u32)> = entries
            .iter()
            .map(|e| (self.key_ref(&e.key), self.value_ref(&e.value)))
            .collect();

        if let Some(candidates) = self.by_hash.get(&hash) {
            for &idx in candidates {
                if self.lists[idx as usize] == refs {
                    return Some(idx);
                }
            }
        }

        let idx = self.lists.len() as u32;
        self.lists.push(refs);
        self.by_hash.entry(hash).or_default().push(idx);
        Some(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    pub fn lists(&self) -> &[Vec<(u32, u32)>] {
        &self.lists
    }
}

/// Filters a decoded tar entry's raw `SCHILY.xattr.*` pairs, dropping unsupported namespaces.
///
/// Mirrors the reference tool's `copy_xattr`: an unsupported prefix is a warning unless
/// `no_skip` is set, in which case it is fatal.
pub fn filter_unsupported(
    raw: Vec<XattrEntry>,
    no_skip: bool,
) -> Result<Vec<XattrEntry>, Error> {
    let mut kept = Vec::with_capacity(raw.len());
    for entry in raw {
        if has_supported_prefix(&entry.key) {
            kept.push(entry);
        } else if no_skip {
            return Err(Error::UnsupportedFeature(format!(
                "xattr key `{}` has an unsupported namespace",
                entry.key
            )));
        } else {
            tracing::warn!(key = %entry.key, "dropping xattr with unsupported namespace");
        }
    }
    Ok(kept)
}

/// One value-pool entry: length-prefixed bytes, stored inline (the out-of-line indirection the
/// on-disk format allows for very large values is never exercised here).
#[derive(Debug, DekuWrite)]
#[deku(endian = "little")]
struct XattrValueRecord {
    val_size: u32,
    #[deku(count = "val_size")]
    value: Vec<u8>,
}

/// One key-value pair as stored in a node's xattr list: the namespace is folded into `kind`
/// rather than repeated in `name`, and the value is referenced by metadata position so identical
/// values across lists share one copy in the value pool.
#[derive(Debug, DekuWrite)]
#[deku(endian = "little")]
struct XattrKeyRecord {
    kind: u16,
    name_size: u16,
    #[deku(count = "name_size")]
    name: Vec<u8>,
    value_ref: u64,
}

/// One distinct node xattr list: where its key records start, how many, and their total byte
/// size. Packed through [`crate::table::write_table`] the same way the fragment and id tables are.
#[derive(Debug, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct XattrIdEntry {
    xattr: u64,
    count: u32,
    size: u32,
}

/// Trailer the superblock's `xattr_table` field actually points at: the kv-pool's own start
/// offset (so a reader can resolve `XattrKeyRecord`/`XattrValueRecord` metadata refs) plus how
/// many distinct lists the id array right before this trailer holds.
#[derive(Debug, DekuWrite)]
#[deku(endian = "little")]
pub(crate) struct XattrIdTableHeader {
    pub xattr_table_start: u64,
    pub xattr_ids: u32,
    pub unused: u32,
}

fn encode_ref(block: u32, offset: u16) -> u64 {
    (u64::from(block) << 16) | u64::from(offset)
}

/// Writes the deduplicated value pool then, per distinct list, its key records, into one shared
/// metadata writer (the "kv pool"); returns the pool's framed bytes and one [`XattrIdEntry`]
/// record per list, in [`XattrTable::lists`] order.
pub(crate) fn build_xattr_tables(
    table: &XattrTable,
    compressor: FilesystemCompressor,
    block_size: u32,
) -> Result<(Vec<u8>, Vec<Vec<u8>>), Error> {
    use deku::DekuContainerWrite;

    let to_bytes = |label: &'static str, bytes: Result<Vec<u8>, deku::DekuError>| {
        bytes.map_err(|e| Error::Compression(format!("{label} serialisation failed: {e}")))
    };

    let mut kv_writer = MetadataWriter::new(compressor, block_size);

    let mut value_refs = Vec::with_capacity(table.values().len());
    for value in table.values() {
        let (block, offset) = kv_writer.position();
        value_refs.push((block, offset));
        let record = XattrValueRecord {
            val_size: value.len() as u32,
            value: value.clone(),
        };
        kv_writer.write(&to_bytes("xattr value", record.to_bytes())?)?;
    }

    let mut id_records = Vec::with_capacity(table.lists().len());
    for list in table.lists() {
        let (list_block, list_offset) = kv_writer.position();
        let mut size = 0u32;
        for &(key_ref, value_ref) in list {
            let key = &table.keys()[key_ref as usize];
            let (kind, suffix) = split_prefix(key)?;
            let (vblock, voffset) = value_refs[value_ref as usize];
            let record = XattrKeyRecord {
                kind,
                name_size: suffix.len() as u16,
                name: suffix.as_bytes().to_vec(),
                value_ref: encode_ref(vblock, voffset),
            };
            let bytes = to_bytes("xattr key", record.to_bytes())?;
            size += bytes.len() as u32;
            kv_writer.write(&bytes)?;
        }
        let entry = XattrIdEntry {
            xattr: encode_ref(list_block, list_offset),
            count: list.len() as u32,
            size,
        };
        id_records.push(to_bytes("xattr id entry", entry.to_bytes())?);
    }

    Ok((kv_writer.finish()?, id_records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> XattrEntry {
        XattrEntry {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn canonicalize_sorts_and_merges_last_write_wins() {
        let entries = vec![entry("user.b", "1"), entry("user.a", "1"), entry("user.a", "2")];
        let canon = canonicalize(entries);
        assert_eq!(canon, vec![entry("user.a", "2"), entry("user.b", "1")]);
    }

    #[test]
    fn equal_lists_share_one_index() {
        let mut table = XattrTable::new();
        let list_a = canonicalize(vec![entry("user.foo", "bar")]);
        let list_b = canonicalize(vec![entry("user.foo", "bar")]);
        let idx_a = table.intern(&list_a).unwrap();
        let idx_b = table.intern(&list_b).unwrap();
        assert_eq!(idx_a, idx_b);
        assert_eq!(table.lists().len(), 1);
    }

    #[test]
    fn thousand_identical_lists_dedup_to_one() {
        let mut table = XattrTable::new();
        let mut last = None;
        for _ in 0..1000 {
            let list = canonicalize(vec![entry("user.foo", "bar")]);
            let idx = table.intern(&list).unwrap();
            if let Some(prev) = last {
                assert_eq!(prev, idx);
            }
            last = Some(idx);
        }
        assert_eq!(table.lists().len(), 1);
    }

    #[test]
    fn empty_list_has_no_index() {
        let mut table = XattrTable::new();
        assert_eq!(table.intern(&[]), None);
    }

    #[test]
    fn unsupported_prefix_dropped_unless_no_skip() {
        let raw = vec![entry("user.ok", "1"), entry("bogus.nope", "2")];
        let kept = filter_unsupported(raw.clone(), false).unwrap();
        assert_eq!(kept.len(), 1);
        assert!(filter_unsupported(raw, true).is_err());
    }
}
