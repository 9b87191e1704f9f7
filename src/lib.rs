//! An emulated, block-addressed, hierarchical filesystem layered over a
//! fixed-size raw-block virtual disk.
//!
//! The disk is an ordinary backing file carved into fixed-size blocks:
//! a superblock, an i-node table, a data region, and a free-space bitmap
//! in the terminal block. On top of it sits a POSIX-flavored file API
//! (open/close/read/write/seek/delete plus directory management) whose
//! state persists across remounts.
//!
//! ```no_run
//! use sfs::Sfs;
//!
//! # fn main() -> sfs::Result<()> {
//! let mut fs = Sfs::format("fs.sfs")?;
//! fs.mkdir("logs")?;
//! fs.chdir("logs")?;
//! let fd = fs.open("today.txt")?;
//! fs.write(fd, b"hello")?;
//! fs.seek(fd, 0)?;
//! # Ok(())
//! # }
//! ```
//!
//! Access is single-threaded and synchronous; there is no journaling and
//! no crash consistency. Remounting an existing disk picks up exactly
//! what the last successful operation left behind.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod disk;
pub mod error;
pub mod fs;
pub mod param;

pub use disk::Disk;
pub use error::{Result, SfsError};
pub use fs::superblock::{DiskGeometry, SFS_MAGIC};
pub use fs::{Fd, FileNames, Sfs};
pub use param::{BSIZE, DISKNAME, FSSIZE, MAXNAME, NINODEBLOCKS, ROOTNAME, SEPARATOR};
