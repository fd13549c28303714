//! [`Dir`] and [`DirEntry`]: the on-disk directory-listing header format.

use deku::prelude::*;

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little")]
pub struct Dir {
    pub count: u32,
    pub start: u32,
    pub inode_num: u32,
    #[deku(count = "*count + 1")]
    pub dir_entries: Vec<DirEntry>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirEntry {
    pub offset: u16,
    pub inode_offset: i16,
    pub t: u16,
    pub name_size: u16,
    #[deku(count = "*name_size + 1")]
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).to_string()
    }
}
