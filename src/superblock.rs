//! The 96-byte record at offset 0 of every SquashFS image.

use deku::prelude::*;

use crate::compressor::Compressor;

pub const MAGIC: u32 = 0x73717368;
pub const VERSION_MAJOR: u16 = 4;
pub const VERSION_MINOR: u16 = 0;
pub const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SuperBlock {
    #[deku(assert_eq = "MAGIC")]
    pub magic: u32,
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: Compressor,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    #[deku(assert_eq = "VERSION_MAJOR")]
    pub version_major: u16,
    #[deku(assert_eq = "VERSION_MINOR")]
    pub version_minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

impl SuperBlock {
    pub const SIZE: usize = 96;

    pub fn new(compressor: Compressor, block_size: u32) -> Self {
        Self {
            magic: MAGIC,
            inode_count: 0,
            mod_time: 0,
            block_size,
            frag_count: 0,
            compressor,
            block_log: block_size.trailing_zeros() as u16,
            flags: 0,
            id_count: 0,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            root_inode: 0,
            bytes_used: 0,
            id_table: NOT_SET,
            xattr_table: NOT_SET,
            inode_table: NOT_SET,
            dir_table: NOT_SET,
            frag_table: NOT_SET,
            export_table: NOT_SET,
        }
    }

    pub fn set_flag(&mut self, flag: Flags) {
        self.flags |= flag as u16;
    }

    pub fn flag(&self, flag: Flags) -> bool {
        self.flags & flag as u16 != 0
    }

    /// Byte length of the compressor-specific options block, if the compressor has one.
    pub fn compression_options_size(&self) -> Option<usize> {
        if !self.flag(Flags::CompressorOptionsArePresent) {
            return None;
        }
        let size = match self.compressor {
            Compressor::Lzma | Compressor::None => 0,
            Compressor::Gzip => 8,
            Compressor::Lzo => 8,
            Compressor::Xz => 8,
            Compressor::Lz4 => 8,
            Compressor::Zstd => 4,
        };
        Some(size + 2)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
#[rustfmt::skip]
pub enum Flags {
    InodesStoredUncompressed    = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    FragmentsAreNotUsed         = 0b0000_0000_0001_0000,
    FragmentsAreAlwaysGenerated = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated     = 0b0000_0000_0100_0000,
    NFSExportTableExists        = 0b0000_0000_1000_0000,
    XattrsAreStoredUncompressed = 0b0000_0001_0000_0000,
    NoXattrsInArchive           = 0b0000_0010_0000_0000,
    CompressorOptionsArePresent = 0b0000_0100_0000_0000,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_log_matches_power_of_two_block_size() {
        let sb = SuperBlock::new(Compressor::Gzip, 0x20000);
        assert_eq!(sb.block_log, 17);
        let sb = SuperBlock::new(Compressor::Gzip, 4096);
        assert_eq!(sb.block_log, 12);
    }

    #[test]
    fn round_trips_through_deku() {
        let mut sb = SuperBlock::new(Compressor::Xz, 0x20000);
        sb.inode_count = 5;
        sb.bytes_used = 12345;
        let bytes = sb.to_bytes().unwrap();
        assert_eq!(bytes.len(), SuperBlock::SIZE);
        let (_, back) = SuperBlock::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(sb, back);
    }
}
