//! The single error carrier shared by every layer.
//!
//! Byte-count operations do not report partial progress through this type:
//! they return the clamped count instead, and `Ok(0)` when asked to do
//! nothing.

use std::io;

use thiserror::Error;

use crate::param::MAXNAME;

/// Everything that can go wrong between the public API and the disk.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("name longer than {} bytes", MAXNAME)]
    NameTooLong,

    #[error("name already exists")]
    NameCollision,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("no such entry")]
    NoSuchEntry,

    #[error("invalid file descriptor")]
    BadDescriptor,

    #[error("seek position past end of file")]
    SeekOutOfRange,

    #[error("i-node table exhausted")]
    NoFreeInodes,

    #[error("data region exhausted")]
    NoFreeBlocks,

    #[error("unsupported filesystem magic {0:#010x}")]
    UnsupportedMagic(u32),

    #[error("disk i/o failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SfsError>;
