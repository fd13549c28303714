//! Compressor contract and the concrete algorithms available to the data and metadata writers.
//!
//! A compressor is a tagged enum rather than a trait object: the writer side only ever needs to
//! select one algorithm per image, and deku needs a concrete, `Copy` identifier to read/write the
//! superblock's `compressor` field and the optional compression-options block that follows it.

use std::io::{Cursor, Read, Write};

use deku::prelude::*;
#[cfg(feature = "gzip")]
use flate2::write::ZlibEncoder;
#[cfg(feature = "gzip")]
use flate2::Compression;
use tracing::instrument;
#[cfg(feature = "xz")]
use xz2::read::XzEncoder;
#[cfg(feature = "xz")]
use xz2::stream::{Check, Filters, LzmaOptions, MtStreamBuilder};

use crate::error::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    #[default]
    Gzip = 1,
    Lzma = 2,
    Lzo  = 3,
    Xz   = 4,
    Lz4  = 5,
    Zstd = 6,
}

impl std::str::FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Compressor::Gzip),
            "lzma" => Ok(Compressor::Lzma),
            "lzo" => Ok(Compressor::Lzo),
            "xz" => Ok(Compressor::Xz),
            "lz4" => Ok(Compressor::Lz4),
            "zstd" => Ok(Compressor::Zstd),
            other => Err(Error::UnsupportedFeature(format!(
                "unknown compressor `{other}`"
            ))),
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, compressor: Compressor"
)]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),
    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),
    #[deku(id = "Compressor::Xz")]
    Xz(Xz),
    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Xz {
    pub dictionary_size: u32,
    pub filters: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Zstd {
    pub compression_level: u32,
}

/// Compressor-specific knobs parsed from the CLI's `--comp-extra` option string.
///
/// Kept separate from [`CompressionOptions`] (the on-disk struct) because some of these tunables
/// (e.g. xz's preset level) influence the encoder without being part of the superblock's
/// compression-options block.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionExtra {
    pub xz_level: Option<u32>,
    pub lzo_level: Option<u32>,
}

/// The resolved compressor an image is built with: the on-disk id, optional on-disk options,
/// and CLI-only tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct FilesystemCompressor {
    pub id: Compressor,
    pub options: Option<CompressionOptions>,
    pub extra: CompressionExtra,
}

impl FilesystemCompressor {
    pub fn new(id: Compressor, options: Option<CompressionOptions>) -> Self {
        Self {
            id,
            options,
            extra: CompressionExtra::default(),
        }
    }
}

impl Default for FilesystemCompressor {
    fn default() -> Self {
        Self::new(Compressor::Gzip, None)
    }
}

/// Compresses a single block; returns `None` when compression would expand the input, in which
/// case the caller stores the block verbatim and sets the "uncompressed" flag.
#[instrument(skip_all)]
pub(crate) fn compress_block(
    bytes: &[u8],
    fc: &FilesystemCompressor,
    block_size: u32,
) -> Result<Option<Vec<u8>>, Error> {
    let compressed = compress(bytes, fc, block_size)?;
    if compressed.len() < bytes.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

fn compress(bytes: &[u8], fc: &FilesystemCompressor, block_size: u32) -> Result<Vec<u8>, Error> {
    match (fc.id, fc.options) {
        #[cfg(feature = "xz")]
        (Compressor::Xz, option) => {
            let dict_size = match option {
                Some(CompressionOptions::Xz(o)) => o.dictionary_size,
                _ => block_size,
            };
            let level = fc.extra.xz_level.unwrap_or(6);
            let check = Check::Crc32;
            let mut opts = LzmaOptions::new_preset(level)
                .map_err(|e| Error::Compression(e.to_string()))?;
            opts.dict_size(dict_size);
            let mut filters = Filters::new();
            filters.lzma2(&opts);
            let stream = MtStreamBuilder::new()
                .threads(2)
                .filters(filters)
                .check(check)
                .encoder()
                .map_err(|e| Error::Compression(e.to_string()))?;
            let mut encoder = XzEncoder::new_stream(Cursor::new(bytes), stream);
            let mut buf = vec![];
            encoder.read_to_end(&mut buf)?;
            Ok(buf)
        },
        #[cfg(feature = "gzip")]
        (Compressor::Gzip, option) => {
            let level = match option {
                Some(CompressionOptions::Gzip(o)) => Compression::new(o.compression_level),
                _ => Compression::best(),
            };
            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            encoder.write_all(bytes)?;
            encoder.finish().map_err(Error::Io)
        },
        #[cfg(feature = "lzo")]
        (Compressor::Lzo, _) => {
            let mut lzo = rust_lzo::LZOContext::new();
            let mut buf = vec![0; rust_lzo::worst_compress(bytes.len())];
            let error = lzo.compress(bytes, &mut buf);
            if error != rust_lzo::LZOError::OK {
                return Err(Error::Compression("lzo compression failed".into()));
            }
            Ok(buf)
        },
        #[cfg(feature = "zstd")]
        (Compressor::Zstd, option) => {
            let level = match option {
                Some(CompressionOptions::Zstd(o)) => o.compression_level as i32,
                _ => 3,
            };
            let mut encoder = zstd::bulk::Compressor::new(level)
                .map_err(|e| Error::Compression(e.to_string()))?;
            encoder
                .compress(bytes)
                .map_err(|e| Error::Compression(e.to_string()))
        },
        (Compressor::None, _) => Ok(bytes.to_vec()),
        (other, _) => Err(Error::UnsupportedFeature(format!(
            "compressor {other:?} not enabled in this build"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_output_is_valid_zlib() {
        use std::io::Read;
        let fc = FilesystemCompressor::new(Compressor::Gzip, None);
        let data = b"hello hello hello hello hello hello".repeat(16);
        let compressed = compress(&data, &fc, 0x20000).unwrap();
        let mut decoder = flate2::read::ZlibDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn incompressible_block_is_reported_as_expanded() {
        // zlib's ~11-byte frame overhead means a short, high-entropy input never shrinks.
        let fc = FilesystemCompressor::new(Compressor::Gzip, None);
        let mut data = Vec::with_capacity(64);
        let mut x: u32 = 0x1234_5678;
        for _ in 0..64 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            data.push((x & 0xff) as u8);
        }
        let result = compress_block(&data, &fc, 0x20000).unwrap();
        assert!(result.is_none(), "caller must fall back to storing the block verbatim");
    }

    #[test]
    fn none_passthrough() {
        let fc = FilesystemCompressor::new(Compressor::None, None);
        let data = b"raw bytes".to_vec();
        let compressed = compress(&data, &fc, 0x20000).unwrap();
        assert_eq!(compressed, data);
    }
}
