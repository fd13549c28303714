use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tar2sqfs::compressor::{CompressionExtra, Compressor};
use tar2sqfs::config::{parse_defaults, parse_kv_list};
use tar2sqfs::Config;

// -musl malloc is slow, use jemalloc
#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Reads a tar archive from standard input and writes it out as a SquashFS image.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the SquashFS image to create
    output: PathBuf,

    /// Compressor to use for data, metadata, and table blocks
    #[arg(long, default_value = "gzip")]
    compressor: Compressor,

    /// Data block size in bytes, must be a power of two >= 4096
    #[arg(long, default_value_t = Config::default().block_size)]
    block_size: u32,

    /// Final image size is padded to a multiple of this many bytes
    #[arg(long, default_value_t = Config::default().dev_block_size)]
    dev_block_size: u32,

    /// Number of worker threads compressing data blocks
    #[arg(long, default_value_t = Config::default().num_jobs)]
    num_jobs: usize,

    /// Maximum number of in-flight block jobs (default: 10 * num-jobs)
    #[arg(long, default_value_t = 0)]
    queue_backlog: usize,

    /// Compressor-specific tuning, e.g. `xz-level=6,lzo-level=9`
    #[arg(long)]
    comp_extra: Option<String>,

    /// Defaults for implicit directories: `uid=,gid=,mode=,mtime=`
    #[arg(long)]
    defaults: Option<String>,

    /// Abort on the first malformed tar record instead of skipping it
    #[arg(long)]
    no_skip: bool,

    /// Drop all extended attributes instead of carrying them into the image
    #[arg(long)]
    no_xattr: bool,

    /// Use each entry's own tar mtime instead of the `--defaults` mtime
    #[arg(long)]
    keep_time: bool,

    /// Emit an NFS export table (inode-number -> inode-reference)
    #[arg(long)]
    exportable: bool,

    /// Overwrite an existing output file
    #[arg(long)]
    force: bool,

    /// Only log warnings and errors
    #[arg(long)]
    quiet: bool,
}

fn build_config(args: &Args) -> Result<Config, tar2sqfs::Error> {
    let mut config = Config {
        compressor: args.compressor,
        block_size: args.block_size,
        dev_block_size: args.dev_block_size,
        num_jobs: args.num_jobs,
        queue_backlog: args.queue_backlog,
        no_skip: args.no_skip,
        no_xattr: args.no_xattr,
        keep_time: args.keep_time,
        exportable: args.exportable,
        force: args.force,
        quiet: args.quiet,
        ..Config::default()
    };

    if let Some(raw) = &args.defaults {
        config.defaults = parse_defaults(raw)?;
    }
    if let Some(raw) = &args.comp_extra {
        let mut extra = CompressionExtra::default();
        for (key, value) in parse_kv_list(raw)? {
            match key.as_str() {
                "xz-level" => extra.xz_level = value.parse().ok(),
                "lzo-level" => extra.lzo_level = value.parse().ok(),
                other => {
                    return Err(tar2sqfs::Error::UnsupportedFeature(format!(
                        "unknown comp-extra key `{other}`"
                    )))
                },
            }
        }
        config.comp_extra = extra;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tar2sqfs: {e}");
            return ExitCode::FAILURE;
        },
    };

    let stdin = io::stdin();
    let mut locked = stdin.lock();
    match tar2sqfs::run(&config, &mut locked, &args.output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tar2sqfs: {e}");
            ExitCode::FAILURE
        },
    }
}
