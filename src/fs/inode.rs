//! I-nodes and the block-address tree.
//!
//! An i-node describes a single unnamed file: its metadata plus the tree
//! of block ids holding its content. The first `NDIRECT` file blocks are
//! listed directly in the record; the next `pointers_per_block` live in a
//! single-indirect block; the rest hang off a double-indirect block of
//! indirect blocks.
//!
//! The central routine is [`walk_range`]: given a contiguous range of
//! file-relative block indices, produce the backing global block ids,
//! creating blocks on demand past the current end. One pass amortizes the
//! tree walk: the indirect and double-indirect blocks are loaded at most
//! once per call, the inner indirect block only at boundary crossings, and
//! metadata writes are coalesced until the end of the call.
//!
//! Byte-range operations ([`read_data`], [`overwrite_data`],
//! [`delete_data`]) run on an [`OpenFile`](super::fdt::OpenFile), whose
//! cached record is authoritative while the slot is live.

use std::convert::TryInto;
use std::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::bitmap::FreeBitmap;
use super::fdt::OpenFile;
use super::superblock::Superblock;
use crate::disk::Disk;
use crate::error::Result;

/// Direct block pointers per i-node.
pub const NDIRECT: usize = 12;

const KIND_FILE: u32 = 0;
const KIND_DIR: u32 = 1;

/// On-disk i-node record.
///
/// Pointer fields are meaningful only once `blocks_allocated` crosses the
/// matching threshold; below it their value is unspecified.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct Dinode {
    /// Size of the file in bytes.
    pub size: u64,
    /// `KIND_DIR` when the i-node backs a directory.
    kind: u32,
    /// Internal file id, assigned monotonically at creation.
    pub file_id: u32,
    /// Reserved: directory entries referencing this i-node.
    pub nlink: u32,
    /// Reserved: owning user.
    pub uid: u32,
    /// Reserved: owning group.
    pub gid: u32,
    /// Data blocks currently backing the file.
    pub blocks_allocated: u32,
    /// Block ids of the first `NDIRECT` file blocks.
    pub direct: [u32; NDIRECT],
    /// Single-indirect block; owned past `NDIRECT` blocks.
    pub indirect: u32,
    /// Double-indirect block; owned past `NDIRECT + pointers_per_block`.
    pub double_indirect: u32,
}

const_assert_eq!(mem::size_of::<Dinode>(), 88);

impl Dinode {
    pub fn new(is_directory: bool, file_id: u32) -> Dinode {
        Dinode {
            kind: if is_directory { KIND_DIR } else { KIND_FILE },
            file_id,
            nlink: 1,
            ..Dinode::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == KIND_DIR
    }
}

/// Where a file-relative block index lives in the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockPos {
    Direct(usize),
    Indirect(usize),
    DoubleIndirect(usize, usize),
}

fn block_pos(b: usize, pointers_per_block: usize) -> BlockPos {
    if b < NDIRECT {
        BlockPos::Direct(b)
    } else if b < NDIRECT + pointers_per_block {
        BlockPos::Indirect(b - NDIRECT)
    } else {
        let b = b - NDIRECT - pointers_per_block;
        BlockPos::DoubleIndirect(b / pointers_per_block, b % pointers_per_block)
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// One metadata block held in memory for the duration of a single call.
#[derive(Debug)]
struct MetaBlock {
    id: u32,
    buf: Vec<u8>,
    dirty: bool,
}

impl MetaBlock {
    fn load(disk: &mut Disk, id: u32) -> Result<MetaBlock> {
        let mut buf = vec![0u8; disk.block_size()];
        disk.read_blocks(id as usize, &mut buf)?;
        Ok(MetaBlock {
            id,
            buf,
            dirty: false,
        })
    }

    fn fresh(block_size: usize, id: u32) -> MetaBlock {
        MetaBlock {
            id,
            buf: vec![0u8; block_size],
            dirty: true,
        }
    }

    fn ptr(&self, slot: usize) -> u32 {
        let bytes = &self.buf[slot * 4..slot * 4 + 4];
        u32::from_ne_bytes(bytes.try_into().expect("block pointer width"))
    }

    fn set_ptr(&mut self, slot: usize, id: u32) {
        self.buf[slot * 4..slot * 4 + 4].copy_from_slice(&id.to_ne_bytes());
        self.dirty = true;
    }

    fn flush(&mut self, disk: &mut Disk) -> Result<()> {
        if self.dirty {
            disk.write_blocks(self.id as usize, &self.buf)?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Outcome of materializing a block range.
struct Walk {
    /// Global block id per requested file block, in range order.
    blocks: Vec<u32>,
    /// How many of them existed before the call.
    existing: usize,
    /// True when the data region ran out mid-range.
    short: bool,
}

/// Map file blocks `[first, last]` to global block ids, allocating past
/// the current end when `bitmap` is present.
///
/// On allocation failure the walk stops at the last block it could map;
/// the partial growth is persisted in `node.blocks_allocated` and the
/// result is marked short so callers can clamp their payload. A fresh
/// metadata block whose leaf never materialized is handed back to the
/// bitmap before returning.
fn walk_range(
    disk: &mut Disk,
    mut bitmap: Option<&mut FreeBitmap>,
    sb: &Superblock,
    node: &mut Dinode,
    first: usize,
    last: usize,
) -> Result<Walk> {
    let p = sb.pointers_per_block();
    let bsize = sb.block_size as usize;
    let old_alloc = node.blocks_allocated as usize;
    debug_assert!(first <= old_alloc, "block range starts past the file end");

    let mut blocks = Vec::with_capacity(last - first + 1);
    let mut existing = last - first + 1;
    let mut short = false;
    let mut allocated = false;

    let mut indirect: Option<MetaBlock> = None;
    let mut outer: Option<MetaBlock> = None;
    let mut inner: Option<(usize, MetaBlock)> = None;

    let mut cur = first;
    while cur <= last {
        let pos = block_pos(cur, p);
        if cur < old_alloc {
            let id = match pos {
                BlockPos::Direct(i) => node.direct[i],
                BlockPos::Indirect(slot) => {
                    if indirect.is_none() {
                        indirect = Some(MetaBlock::load(disk, node.indirect)?);
                    }
                    indirect.as_ref().expect("indirect block").ptr(slot)
                }
                BlockPos::DoubleIndirect(o, i) => {
                    if outer.is_none() {
                        outer = Some(MetaBlock::load(disk, node.double_indirect)?);
                    }
                    let outer_ref = outer.as_ref().expect("double-indirect block");
                    if inner.as_ref().map(|(slot, _)| *slot) != Some(o) {
                        if let Some((_, mut done)) = inner.take() {
                            done.flush(disk)?;
                        }
                        inner = Some((o, MetaBlock::load(disk, outer_ref.ptr(o))?));
                    }
                    inner.as_ref().expect("inner indirect block").1.ptr(i)
                }
            };
            blocks.push(id);
        } else {
            // Growing: every block from here on is newly allocated.
            existing = existing.min(blocks.len());
            let map = bitmap.as_mut().expect("grew a file without an allocator");
            match pos {
                BlockPos::Direct(i) => match map.alloc_data() {
                    Some(id) => {
                        node.direct[i] = id;
                        blocks.push(id);
                        allocated = true;
                    }
                    None => {
                        short = true;
                        break;
                    }
                },
                BlockPos::Indirect(slot) => {
                    // The first block past the direct region owns a fresh
                    // indirect block.
                    let mut fresh_indirect = None;
                    if cur == NDIRECT {
                        match map.alloc_data() {
                            Some(id) => {
                                node.indirect = id;
                                indirect = Some(MetaBlock::fresh(bsize, id));
                                fresh_indirect = Some(id);
                                allocated = true;
                            }
                            None => {
                                short = true;
                                break;
                            }
                        }
                    } else if indirect.is_none() {
                        indirect = Some(MetaBlock::load(disk, node.indirect)?);
                    }
                    match map.alloc_data() {
                        Some(id) => {
                            indirect.as_mut().expect("indirect block").set_ptr(slot, id);
                            blocks.push(id);
                            allocated = true;
                        }
                        None => {
                            if let Some(id) = fresh_indirect {
                                map.free_data(id);
                                indirect = None;
                            }
                            short = true;
                            break;
                        }
                    }
                }
                BlockPos::DoubleIndirect(o, i) => {
                    let mut fresh_outer = None;
                    let mut fresh_inner = None;
                    // The first block past the single-indirect region owns
                    // a fresh double-indirect block.
                    if cur == NDIRECT + p {
                        match map.alloc_data() {
                            Some(id) => {
                                node.double_indirect = id;
                                outer = Some(MetaBlock::fresh(bsize, id));
                                fresh_outer = Some(id);
                                allocated = true;
                            }
                            None => {
                                short = true;
                                break;
                            }
                        }
                    } else if outer.is_none() {
                        outer = Some(MetaBlock::load(disk, node.double_indirect)?);
                    }
                    if inner.as_ref().map(|(slot, _)| *slot) != Some(o) {
                        if let Some((_, mut done)) = inner.take() {
                            done.flush(disk)?;
                        }
                        if i == 0 {
                            // Entering an untouched inner slot.
                            match map.alloc_data() {
                                Some(id) => {
                                    outer
                                        .as_mut()
                                        .expect("double-indirect block")
                                        .set_ptr(o, id);
                                    inner = Some((o, MetaBlock::fresh(bsize, id)));
                                    fresh_inner = Some(id);
                                    allocated = true;
                                }
                                None => {
                                    if let Some(id) = fresh_outer {
                                        map.free_data(id);
                                        outer = None;
                                    }
                                    short = true;
                                    break;
                                }
                            }
                        } else {
                            let id = outer.as_ref().expect("double-indirect block").ptr(o);
                            inner = Some((o, MetaBlock::load(disk, id)?));
                        }
                    }
                    match map.alloc_data() {
                        Some(id) => {
                            inner
                                .as_mut()
                                .expect("inner indirect block")
                                .1
                                .set_ptr(i, id);
                            blocks.push(id);
                            allocated = true;
                        }
                        None => {
                            if let Some(id) = fresh_inner {
                                map.free_data(id);
                                inner = None;
                            }
                            if let Some(id) = fresh_outer {
                                map.free_data(id);
                                outer = None;
                            }
                            short = true;
                            break;
                        }
                    }
                }
            }
        }
        cur += 1;
    }

    if let Some(mut meta) = indirect {
        meta.flush(disk)?;
    }
    if let Some(mut meta) = outer {
        meta.flush(disk)?;
    }
    if let Some((_, mut meta)) = inner {
        meta.flush(disk)?;
    }
    if cur > old_alloc {
        node.blocks_allocated = cur as u32;
    }
    if allocated {
        bitmap
            .as_mut()
            .expect("allocated without an allocator")
            .flush(disk)?;
    }

    Ok(Walk {
        blocks,
        existing,
        short,
    })
}

/// Read the i-node record `id` from its home block.
pub(crate) fn load_dinode(disk: &mut Disk, sb: &Superblock, id: u32) -> Result<Dinode> {
    let mut buf = vec![0u8; sb.block_size as usize];
    disk.read_blocks(sb.inode_block_of(id), &mut buf)?;
    let off = (id as usize % sb.inodes_per_block()) * mem::size_of::<Dinode>();
    let mut record = Dinode::default();
    record
        .as_bytes_mut()
        .copy_from_slice(&buf[off..off + mem::size_of::<Dinode>()]);
    Ok(record)
}

/// Patch the i-node record `id` back into its home block.
pub(crate) fn flush_dinode(disk: &mut Disk, sb: &Superblock, id: u32, record: &Dinode) -> Result<()> {
    let mut buf = vec![0u8; sb.block_size as usize];
    let home = sb.inode_block_of(id);
    disk.read_blocks(home, &mut buf)?;
    let off = (id as usize % sb.inodes_per_block()) * mem::size_of::<Dinode>();
    buf[off..off + mem::size_of::<Dinode>()].copy_from_slice(record.as_bytes());
    disk.write_blocks(home, &buf)
}

/// Copy bytes at the read cursor into `dst`, clamped to the file size.
/// Never grows the file.
pub(crate) fn read_data(
    disk: &mut Disk,
    sb: &Superblock,
    of: &mut OpenFile,
    dst: &mut [u8],
) -> Result<usize> {
    let bsize = sb.block_size as u64;
    let avail = of.dinode.size.saturating_sub(of.read_cursor);
    let n = (dst.len() as u64).min(avail);
    if n == 0 {
        return Ok(0);
    }

    let first = (of.read_cursor / bsize) as usize;
    let last = ((of.read_cursor + n - 1) / bsize) as usize;
    let walk = walk_range(disk, None, sb, &mut of.dinode, first, last)?;

    let mut block_buf = vec![0u8; bsize as usize];
    let mut local = (of.read_cursor % bsize) as usize;
    let mut copied = 0usize;
    for id in &walk.blocks {
        if copied as u64 >= n {
            break;
        }
        disk.read_blocks(*id as usize, &mut block_buf)?;
        let span = ((n - copied as u64) as usize).min(bsize as usize - local);
        dst[copied..copied + span].copy_from_slice(&block_buf[local..local + span]);
        copied += span;
        local = 0;
    }

    of.read_cursor += n;
    Ok(n as usize)
}

/// Write `src` at the write cursor, materializing blocks as needed and
/// growing the size only past the old end. Returns the clamped count when
/// the file or the data region cannot hold the full request.
pub(crate) fn overwrite_data(
    disk: &mut Disk,
    bitmap: &mut FreeBitmap,
    sb: &Superblock,
    of: &mut OpenFile,
    src: &[u8],
) -> Result<usize> {
    let bsize = sb.block_size as u64;
    let cap = sb.max_file_blocks() as u64 * bsize;
    let mut n = (src.len() as u64).min(cap.saturating_sub(of.write_cursor));
    if n == 0 {
        return Ok(0);
    }

    let first = (of.write_cursor / bsize) as usize;
    let last = ((of.write_cursor + n - 1) / bsize) as usize;
    let walk = walk_range(disk, Some(bitmap), sb, &mut of.dinode, first, last)?;
    if walk.short {
        // Partial growth stays persisted; the payload shrinks to fit it.
        n = (of.dinode.blocks_allocated as u64 * bsize).saturating_sub(of.write_cursor);
        if n == 0 {
            return Ok(0);
        }
    }

    if of.write_cursor + n > of.dinode.size {
        of.dinode.size = of.write_cursor + n;
    }

    let mut block_buf = vec![0u8; bsize as usize];
    let mut local = (of.write_cursor % bsize) as usize;
    let mut written = 0usize;
    for (i, id) in walk.blocks.iter().enumerate() {
        if written as u64 >= n {
            break;
        }
        let span = ((n - written as u64) as usize).min(bsize as usize - local);
        // Read back the block unless it is brand new or fully overwritten.
        if i < walk.existing && (local != 0 || span < bsize as usize) {
            disk.read_blocks(*id as usize, &mut block_buf)?;
        }
        block_buf[local..local + span].copy_from_slice(&src[written..written + span]);
        disk.write_blocks(*id as usize, &block_buf)?;
        written += span;
        local = 0;
    }

    of.write_cursor += n;
    flush_dinode(disk, sb, of.inode, &of.dinode)?;
    Ok(n as usize)
}

/// Delete `n` bytes immediately before the write cursor (non-inclusive),
/// shifting the file tail back and releasing every block that falls past
/// the new end.
pub(crate) fn delete_data(
    disk: &mut Disk,
    bitmap: &mut FreeBitmap,
    sb: &Superblock,
    of: &mut OpenFile,
    n: u64,
) -> Result<u64> {
    let bsize = sb.block_size as u64;
    let n = n.min(of.write_cursor);
    if n == 0 {
        return Ok(0);
    }

    let old_size = of.dinode.size;
    let old_alloc = of.dinode.blocks_allocated as usize;
    let save_size = old_size - of.write_cursor;

    let first = ((of.write_cursor - n) / bsize) as usize;
    let walk = walk_range(disk, None, sb, &mut of.dinode, first, old_alloc - 1)?;

    // Buffer the tail from the write cursor to the end of the file.
    let mut tail = vec![0u8; save_size as usize];
    let mut block_buf = vec![0u8; bsize as usize];
    if save_size > 0 {
        let mut i = (of.write_cursor / bsize) as usize - first;
        let mut local = (of.write_cursor % bsize) as usize;
        let mut copied = 0usize;
        while (copied as u64) < save_size {
            disk.read_blocks(walk.blocks[i] as usize, &mut block_buf)?;
            let span = ((save_size - copied as u64) as usize).min(bsize as usize - local);
            tail[copied..copied + span].copy_from_slice(&block_buf[local..local + span]);
            copied += span;
            local = 0;
            i += 1;
        }
    }

    // Shift the cursor back and lay the tail down from there.
    of.write_cursor -= n;
    if save_size > 0 {
        let mut local = (of.write_cursor % bsize) as usize;
        let mut written = 0usize;
        let mut i = 0usize;
        while (written as u64) < save_size {
            // The head of the first block survives; everything after is
            // overwritten whole.
            if local != 0 {
                disk.read_blocks(walk.blocks[i] as usize, &mut block_buf)?;
            }
            let span = ((save_size - written as u64) as usize).min(bsize as usize - local);
            block_buf[local..local + span].copy_from_slice(&tail[written..written + span]);
            disk.write_blocks(walk.blocks[i] as usize, &block_buf)?;
            written += span;
            local = 0;
            i += 1;
        }
    }

    // A read cursor inside the deleted range clamps to the new write
    // cursor; one past it shifts back with the tail.
    if of.read_cursor >= of.write_cursor + n {
        of.read_cursor -= n;
    } else if of.read_cursor > of.write_cursor {
        of.read_cursor = of.write_cursor;
    }

    // Recompute the block budget from the final size and free what fell
    // off the end, including de-escalated indirect blocks.
    of.dinode.size = old_size - n;
    let new_alloc = ceil_div(of.dinode.size as usize, bsize as usize);
    for i in new_alloc..old_alloc {
        bitmap.free_data(walk.blocks[i - first]);
    }
    let p = sb.pointers_per_block();
    if old_alloc > NDIRECT && new_alloc <= NDIRECT {
        bitmap.free_data(of.dinode.indirect);
    }
    if old_alloc > NDIRECT + p {
        let old_inner = ceil_div(old_alloc - NDIRECT - p, p);
        let new_inner = if new_alloc > NDIRECT + p {
            ceil_div(new_alloc - NDIRECT - p, p)
        } else {
            0
        };
        if new_inner < old_inner {
            let outer = MetaBlock::load(disk, of.dinode.double_indirect)?;
            for slot in new_inner..old_inner {
                bitmap.free_data(outer.ptr(slot));
            }
            if new_alloc <= NDIRECT + p {
                bitmap.free_data(of.dinode.double_indirect);
            }
        }
    }
    of.dinode.blocks_allocated = new_alloc as u32;

    flush_dinode(disk, sb, of.inode, &of.dinode)?;
    bitmap.flush(disk)?;
    Ok(n)
}

/// Release every data block the tree owns, including the indirect blocks
/// themselves. The bitmap is left dirty for the caller to flush.
pub(crate) fn free_tree(
    disk: &mut Disk,
    bitmap: &mut FreeBitmap,
    sb: &Superblock,
    node: &mut Dinode,
) -> Result<()> {
    let alloc = node.blocks_allocated as usize;
    if alloc == 0 {
        return Ok(());
    }
    let walk = walk_range(disk, None, sb, node, 0, alloc - 1)?;
    for id in &walk.blocks {
        bitmap.free_data(*id);
    }
    let p = sb.pointers_per_block();
    if alloc > NDIRECT {
        bitmap.free_data(node.indirect);
    }
    if alloc > NDIRECT + p {
        let outer = MetaBlock::load(disk, node.double_indirect)?;
        for slot in 0..ceil_div(alloc - NDIRECT - p, p) {
            bitmap.free_data(outer.ptr(slot));
        }
        bitmap.free_data(node.double_indirect);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::superblock::DiskGeometry;

    #[test]
    fn block_pos_covers_all_three_regions() {
        let p = 32;
        assert_eq!(block_pos(0, p), BlockPos::Direct(0));
        assert_eq!(block_pos(11, p), BlockPos::Direct(11));
        assert_eq!(block_pos(12, p), BlockPos::Indirect(0));
        assert_eq!(block_pos(12 + 31, p), BlockPos::Indirect(31));
        assert_eq!(block_pos(12 + 32, p), BlockPos::DoubleIndirect(0, 0));
        assert_eq!(block_pos(12 + 32 + 33, p), BlockPos::DoubleIndirect(1, 1));
    }

    // 128-byte blocks: 32 pointers per block, so the indirect region ends
    // at file block 43 and the double-indirect region starts at 44.
    fn small_fixture() -> (Disk, Superblock, FreeBitmap, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let sb = Superblock::new(DiskGeometry {
            block_size: 128,
            fs_blocks: 128,
            inode_blocks: 4,
        });
        let disk = Disk::format(&path, 128, 128).unwrap();
        let bitmap = FreeBitmap::new(&sb);
        (disk, sb, bitmap, dir)
    }

    #[test]
    fn growth_allocates_metadata_at_region_boundaries() {
        let (mut disk, sb, mut bitmap, _dir) = small_fixture();
        let mut node = Dinode::new(false, 1);

        let walk = walk_range(&mut disk, Some(&mut bitmap), &sb, &mut node, 0, 12).unwrap();
        assert!(!walk.short);
        assert_eq!(walk.existing, 0);
        assert_eq!(walk.blocks.len(), 13);
        assert_eq!(node.blocks_allocated, 13);
        // 13 leaves plus the fresh indirect block.
        assert_eq!(bitmap.allocated_data(), 14);

        // Crossing into the double-indirect region costs the outer block
        // and one inner indirect block.
        let walk = walk_range(&mut disk, Some(&mut bitmap), &sb, &mut node, 13, 44).unwrap();
        assert!(!walk.short);
        assert_eq!(node.blocks_allocated, 45);
        assert_eq!(bitmap.allocated_data(), 45 + 1 + 1 + 1);
    }

    #[test]
    fn rewalking_existing_blocks_allocates_nothing() {
        let (mut disk, sb, mut bitmap, _dir) = small_fixture();
        let mut node = Dinode::new(false, 1);

        let grown = walk_range(&mut disk, Some(&mut bitmap), &sb, &mut node, 0, 44).unwrap();
        let before = bitmap.allocated_data();

        let again = walk_range(&mut disk, None, &sb, &mut node, 0, 44).unwrap();
        assert_eq!(again.blocks, grown.blocks);
        assert_eq!(again.existing, 45);
        assert_eq!(bitmap.allocated_data(), before);
    }

    #[test]
    fn exhaustion_keeps_the_bitmap_consistent() {
        let (mut disk, sb, mut bitmap, _dir) = small_fixture();

        // Eat the whole data region except 3 blocks.
        let total = sb.data_blocks();
        for _ in 0..total - 3 {
            bitmap.alloc_data().unwrap();
        }

        let mut node = Dinode::new(false, 1);
        let walk = walk_range(&mut disk, Some(&mut bitmap), &sb, &mut node, 0, 12).unwrap();
        assert!(walk.short);
        assert_eq!(walk.existing, 0);
        // 3 remaining blocks hold 3 direct leaves; the walk stopped there.
        assert_eq!(node.blocks_allocated, 3);
        assert_eq!(walk.blocks.len(), 3);
        assert_eq!(bitmap.allocated_data(), total);
    }

    #[test]
    fn free_tree_returns_every_bit() {
        let (mut disk, sb, mut bitmap, _dir) = small_fixture();
        let mut node = Dinode::new(false, 1);
        walk_range(&mut disk, Some(&mut bitmap), &sb, &mut node, 0, 50).unwrap();
        assert!(bitmap.allocated_data() > 51);

        free_tree(&mut disk, &mut bitmap, &sb, &mut node).unwrap();
        assert_eq!(bitmap.allocated_data(), 0);
    }
}
