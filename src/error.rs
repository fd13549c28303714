//! Errors

use std::io;

use thiserror::Error;

/// Errors produced by the tar-to-SquashFS pipeline.
///
/// Variants map onto the error kinds every component is expected to raise: callers
/// match on kind rather than on an open-ended list of causes.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed tar stream: bad checksum, truncated record, inconsistent sparse map.
    #[error("malformed tar input: {0}")]
    InputFormat(String),

    /// A record type, header extension, or xattr namespace this decoder does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A tree insertion that would violate a filesystem-tree invariant.
    #[error("tree constraint violated for {path}: {reason}")]
    TreeConstraint { path: String, reason: String },

    /// A compressor refused its input or could not be configured.
    #[error("compression error: {0}")]
    Compression(String),

    /// I/O failure reading the tar stream or writing the image.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Allocation failure, or a channel closed unexpectedly.
    #[error("resource error: {0}")]
    Resource(String),

    /// An invariant the pipeline itself is responsible for upholding was violated.
    #[error("internal error (inode {inode:?}): {message}")]
    Internal {
        inode: Option<u32>,
        message: &'static str,
    },
}

impl Error {
    pub fn internal(message: &'static str) -> Self {
        Error::Internal {
            inode: None,
            message,
        }
    }

    pub fn internal_at(inode: u32, message: &'static str) -> Self {
        Error::Internal {
            inode: Some(inode),
            message,
        }
    }

    pub fn tree_constraint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::TreeConstraint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
