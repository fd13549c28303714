//! [`Config`]: the library's CLI-independent options struct. The binary's `clap` parser builds
//! one of these and hands it to [`crate::run`]; anything that wants to drive the pipeline without
//! going through argv (a test, an embedder) builds one directly.

use crate::compressor::{Compressor, CompressionExtra, CompressionOptions};
use crate::error::Error;
use crate::tree::Defaults;

#[derive(Debug, Clone)]
pub struct Config {
    pub compressor: Compressor,
    pub compression_options: Option<CompressionOptions>,
    pub comp_extra: CompressionExtra,
    pub block_size: u32,
    pub dev_block_size: u32,
    pub num_jobs: usize,
    pub queue_backlog: usize,
    pub defaults: Defaults,
    pub no_skip: bool,
    pub no_xattr: bool,
    pub keep_time: bool,
    pub exportable: bool,
    pub force: bool,
    pub quiet: bool,
}

impl Config {
    pub const MIN_BLOCK_SIZE: u32 = 4096;
    pub const MIN_DEV_BLOCK_SIZE: u32 = 1024;

    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size < Self::MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(Error::UnsupportedFeature(format!(
                "block-size must be a power of two >= {}, got {}",
                Self::MIN_BLOCK_SIZE,
                self.block_size
            )));
        }
        if self.dev_block_size < Self::MIN_DEV_BLOCK_SIZE {
            return Err(Error::UnsupportedFeature(format!(
                "dev-block-size must be >= {}, got {}",
                Self::MIN_DEV_BLOCK_SIZE,
                self.dev_block_size
            )));
        }
        if self.num_jobs == 0 {
            return Err(Error::UnsupportedFeature("num-jobs must be >= 1".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compressor: Compressor::Gzip,
            compression_options: None,
            comp_extra: CompressionExtra::default(),
            block_size: 0x20000,
            dev_block_size: 4096,
            num_jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            queue_backlog: 0,
            defaults: Defaults {
                uid: 0,
                gid: 0,
                permissions: 0o755,
                mtime: 0,
            },
            no_skip: false,
            no_xattr: false,
            keep_time: false,
            exportable: false,
            force: false,
            quiet: false,
        }
    }
}

impl Config {
    /// The bounded work-queue's capacity: `queue_backlog` if set, else `10 * num_jobs`.
    pub fn effective_backlog(&self) -> usize {
        if self.queue_backlog > 0 {
            self.queue_backlog
        } else {
            10 * self.num_jobs.max(1)
        }
    }
}

/// Parses a `key=value[,key=value]*` option string (the `--defaults` and `--comp-extra` grammar).
pub(crate) fn parse_kv_list(raw: &str) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    for part in raw.split(',') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').ok_or_else(|| {
            Error::UnsupportedFeature(format!("malformed option `{part}`, expected key=value"))
        })?;
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

/// Parses the `--defaults` option string into a [`Defaults`] overriding the built-in zeroed ones.
pub fn parse_defaults(raw: &str) -> Result<Defaults, Error> {
    let mut defaults = Defaults {
        uid: 0,
        gid: 0,
        permissions: 0o755,
        mtime: 0,
    };
    for (key, value) in parse_kv_list(raw)? {
        match key.as_str() {
            "uid" => defaults.uid = parse_num(&value)?,
            "gid" => defaults.gid = parse_num(&value)?,
            "mode" => {
                defaults.permissions = u16::from_str_radix(value.trim_start_matches("0o"), 8)
                    .map_err(|_| Error::UnsupportedFeature(format!("invalid mode `{value}`")))?
            },
            "mtime" => defaults.mtime = parse_num(&value)?,
            other => {
                return Err(Error::UnsupportedFeature(format!(
                    "unknown defaults key `{other}`"
                )))
            },
        }
    }
    Ok(defaults)
}

fn parse_num(value: &str) -> Result<u32, Error> {
    value
        .parse()
        .map_err(|_| Error::UnsupportedFeature(format!("expected a number, got `{value}`")))
}
