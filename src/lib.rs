#![doc = include_str!("../README.md")]

pub mod compressor;
pub mod config;
mod data;
mod dir;
mod entry;
pub mod error;
mod fragment;
mod id;
mod inode;
mod metadata;
mod serializer;
mod sink;
mod superblock;
mod table;
mod tar;
mod tree;
pub mod xattr;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::serializer::run;
pub use crate::tree::Defaults;
