//! Free-space bitmap.
//!
//! Two logical bit arrays share the terminal disk block: one bit per
//! i-node slot first, one bit per data-region block after. A set bit means
//! free. Padding bits past each logical end are pinned to 0 so a naive
//! scan can never hand out an out-of-range index.
//!
//! Allocation is first-fit: leftmost byte first, most significant bit
//! first within a byte. That order is part of the contract so allocation
//! is reproducible.

use log::warn;

use super::superblock::Superblock;
use crate::disk::Disk;
use crate::error::Result;

/// In-memory copy of the terminal bitmap block.
#[derive(Debug)]
pub struct FreeBitmap {
    /// I-node bytes followed by data bytes.
    bits: Vec<u8>,
    inode_bytes: usize,
    inode_bits: usize,
    data_bits: usize,
    /// Global block id of the first data-region block.
    data_start: u32,
    /// Block index the map is persisted at.
    home: usize,
    block_size: usize,
}

impl FreeBitmap {
    /// Bitmap for a fresh disk: everything free. The caller flushes.
    pub fn new(sb: &Superblock) -> FreeBitmap {
        let inode_bits = sb.ninodes() as usize;
        let data_bits = sb.data_blocks() as usize;
        let inode_bytes = (inode_bits + 7) / 8;
        let data_bytes = (data_bits + 7) / 8;

        let mut bits = vec![0xffu8; inode_bytes + data_bytes];
        if inode_bits % 8 != 0 {
            bits[inode_bytes - 1] &= 0xff << (8 - inode_bits % 8);
        }
        if data_bits % 8 != 0 {
            bits[inode_bytes + data_bytes - 1] &= 0xff << (8 - data_bits % 8);
        }

        FreeBitmap {
            bits,
            inode_bytes,
            inode_bits,
            data_bits,
            data_start: sb.data_start(),
            home: sb.bitmap_block(),
            block_size: sb.block_size as usize,
        }
    }

    /// Read the persisted bitmap back from the terminal block.
    pub fn load(sb: &Superblock, disk: &mut Disk) -> Result<FreeBitmap> {
        let mut map = FreeBitmap::new(sb);
        let mut buf = vec![0u8; map.block_size];
        disk.read_blocks(map.home, &mut buf)?;
        let len = map.bits.len();
        map.bits.copy_from_slice(&buf[..len]);
        Ok(map)
    }

    /// Rewrite the terminal block.
    pub fn flush(&self, disk: &mut Disk) -> Result<()> {
        let mut buf = vec![0u8; self.block_size];
        buf[..self.bits.len()].copy_from_slice(&self.bits);
        disk.write_blocks(self.home, &buf)
    }

    /// Allocate an i-node slot; the id is table-relative.
    pub fn alloc_inode(&mut self) -> Option<u32> {
        self.grab(0, self.inode_bytes).map(|idx| idx as u32)
    }

    /// Allocate a data block; the id is the global block index.
    pub fn alloc_data(&mut self) -> Option<u32> {
        self.grab(self.inode_bytes, self.bits.len())
            .map(|idx| idx as u32 + self.data_start)
    }

    /// Release an i-node slot. Out-of-range ids are logged, not fatal.
    pub fn free_inode(&mut self, id: u32) {
        if id as usize >= self.inode_bits {
            warn!("freeing i-node {} outside the table", id);
            return;
        }
        self.put_back(id as usize, 0);
    }

    /// Release a data block by global id. Out-of-range ids are logged,
    /// not fatal.
    pub fn free_data(&mut self, block: u32) {
        if block < self.data_start || (block - self.data_start) as usize >= self.data_bits {
            warn!("freeing block {} outside the data region", block);
            return;
        }
        self.put_back((block - self.data_start) as usize, self.inode_bytes);
    }

    /// Whether i-node `id` is currently allocated.
    pub fn inode_allocated(&self, id: u32) -> bool {
        let idx = id as usize;
        idx < self.inode_bits && self.bits[idx / 8] & (0x80 >> (idx % 8)) == 0
    }

    /// Count of live i-nodes.
    pub fn allocated_inodes(&self) -> u32 {
        let free: u32 = self.bits[..self.inode_bytes]
            .iter()
            .map(|b| b.count_ones())
            .sum();
        self.inode_bits as u32 - free
    }

    /// Count of allocated data blocks.
    pub fn allocated_data(&self) -> u32 {
        let free: u32 = self.bits[self.inode_bytes..]
            .iter()
            .map(|b| b.count_ones())
            .sum();
        self.data_bits as u32 - free
    }

    /// First-fit scan over `[start, end)` bytes; returns the flipped bit's
    /// index relative to `start`.
    fn grab(&mut self, start: usize, end: usize) -> Option<usize> {
        for i in start..end {
            if self.bits[i] == 0 {
                continue;
            }
            for j in 0..8 {
                let mask = 0x80u8 >> j;
                if self.bits[i] & mask != 0 {
                    self.bits[i] &= !mask;
                    return Some((i - start) * 8 + j);
                }
            }
        }
        None
    }

    fn put_back(&mut self, idx: usize, base: usize) {
        self.bits[base + idx / 8] |= 0x80 >> (idx % 8);
    }
}
