//! Persistent geometry and the root pointer.
//!
//! Disk layout by block index:
//! ```text
//! [ superblock | i-node table | data region | free bitmap ]
//!       0        1..=inodes     ..fs_size-2    fs_size-1
//! ```
//!
//! The superblock is written once at format time and read once on mount;
//! everything else about the geometry is derived from it.

use std::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::inode::{Dinode, NDIRECT};
use crate::disk::Disk;
use crate::error::{Result, SfsError};
use crate::param;

/// Every well-formed disk starts with this magic number.
pub const SFS_MAGIC: u32 = 0xACBD_0005;

/// Format-time geometry knobs, immutable once the disk exists.
#[derive(Clone, Copy, Debug)]
pub struct DiskGeometry {
    /// Block size in bytes.
    pub block_size: u32,
    /// Total filesystem size in blocks.
    pub fs_blocks: u32,
    /// Blocks reserved for the i-node table.
    pub inode_blocks: u32,
}

impl Default for DiskGeometry {
    fn default() -> DiskGeometry {
        DiskGeometry {
            block_size: param::BSIZE,
            fs_blocks: param::FSSIZE,
            inode_blocks: param::NINODEBLOCKS,
        }
    }
}

/// On-disk superblock record, stored zero-padded in block 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct Superblock {
    /// Must be [`SFS_MAGIC`].
    pub magic: u32,
    /// Block size in bytes.
    pub block_size: u32,
    /// Size of the filesystem in blocks.
    pub fs_size: u32,
    /// Length of the i-node table in blocks.
    pub inode_blocks: u32,
    /// I-node id of the root directory.
    pub root_inode: i32,
}

const_assert!(mem::size_of::<Superblock>() == 20);

impl Superblock {
    pub fn new(geometry: DiskGeometry) -> Superblock {
        Superblock {
            magic: SFS_MAGIC,
            block_size: geometry.block_size,
            fs_size: geometry.fs_blocks,
            inode_blocks: geometry.inode_blocks,
            root_inode: -1,
        }
    }

    /// Parse block 0. A magic mismatch is a fatal mount error.
    pub fn load(disk: &mut Disk) -> Result<Superblock> {
        let mut buf = vec![0u8; disk.block_size()];
        disk.read_blocks(0, &mut buf)?;
        let mut sb = Superblock::default();
        sb.as_bytes_mut()
            .copy_from_slice(&buf[..mem::size_of::<Superblock>()]);
        if sb.magic != SFS_MAGIC {
            return Err(SfsError::UnsupportedMagic(sb.magic));
        }
        Ok(sb)
    }

    /// Serialize into a zero-padded block and write block 0.
    pub fn save(&self, disk: &mut Disk) -> Result<()> {
        let mut buf = vec![0u8; disk.block_size()];
        buf[..mem::size_of::<Superblock>()].copy_from_slice(self.as_bytes());
        disk.write_blocks(0, &buf)
    }

    /// I-node records that fit in one table block.
    pub fn inodes_per_block(&self) -> usize {
        self.block_size as usize / mem::size_of::<Dinode>()
    }

    /// Block pointers that fit in one block.
    pub fn pointers_per_block(&self) -> usize {
        self.block_size as usize / mem::size_of::<u32>()
    }

    /// Hard cap on file size, in blocks.
    pub fn max_file_blocks(&self) -> usize {
        let p = self.pointers_per_block();
        NDIRECT + p + p * p
    }

    /// Total i-node slots in the table.
    pub fn ninodes(&self) -> u32 {
        self.inode_blocks * self.inodes_per_block() as u32
    }

    /// Table block holding i-node `id`.
    pub fn inode_block_of(&self, id: u32) -> usize {
        1 + id as usize / self.inodes_per_block()
    }

    /// First block of the data region.
    pub fn data_start(&self) -> u32 {
        1 + self.inode_blocks
    }

    /// Number of blocks in the data region.
    pub fn data_blocks(&self) -> u32 {
        self.fs_size - self.inode_blocks - 2
    }

    /// Index of the terminal bitmap block.
    pub fn bitmap_block(&self) -> usize {
        self.fs_size as usize - 1
    }
}
