//! Open-file table.
//!
//! A growable slot array caching every opened i-node together with its
//! read and write cursors. The cached record is authoritative while the
//! slot is live; mutations go back to disk through
//! [`flush_inode`](FileTable::flush_inode).

use super::inode::{self, Dinode};
use super::superblock::Superblock;
use crate::disk::Disk;
use crate::error::{Result, SfsError};

/// Slots are grown and reclaimed in chunks of this many entries.
const SLOT_CHUNK: usize = 3;

/// One open file.
#[derive(Debug)]
pub struct OpenFile {
    /// I-node id backing this slot.
    pub inode: u32,
    pub read_cursor: u64,
    pub write_cursor: u64,
    /// Cached copy of the on-disk record.
    pub dinode: Dinode,
}

/// The table itself. At most one live slot per i-node.
#[derive(Debug, Default)]
pub struct FileTable {
    slots: Vec<Option<OpenFile>>,
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable::default()
    }

    pub fn get(&self, slot: usize) -> Option<&OpenFile> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Slot currently holding `inode`, if any.
    pub fn find(&self, inode: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(of) if of.inode == inode))
    }

    /// Open `inode`, reusing its live slot when it is already open.
    /// Returns the slot index and whether this call opened it; a fresh
    /// slot reads at 0 and writes at the end of the file.
    pub fn open(&mut self, disk: &mut Disk, sb: &Superblock, inode: u32) -> Result<(usize, bool)> {
        if let Some(slot) = self.find(inode) {
            return Ok((slot, false));
        }
        let dinode = inode::load_dinode(disk, sb, inode)?;
        let of = OpenFile {
            inode,
            read_cursor: 0,
            write_cursor: dinode.size,
            dinode,
        };
        Ok((self.insert(of), true))
    }

    /// Place `of` in the first vacant slot, growing by a chunk when full.
    pub fn insert(&mut self, of: OpenFile) -> usize {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                let slot = self.slots.len();
                self.slots.resize_with(slot + SLOT_CHUNK, || None);
                slot
            }
        };
        self.slots[slot] = Some(of);
        slot
    }

    /// Vacate `slot`, then give back whole trailing chunks of vacant
    /// slots. Closing never writes anything; callers flush as they mutate.
    pub fn close(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = None;
        }
        while self.slots.len() >= SLOT_CHUNK
            && self.slots[self.slots.len() - SLOT_CHUNK..]
                .iter()
                .all(Option::is_none)
        {
            let len = self.slots.len();
            self.slots.truncate(len - SLOT_CHUNK);
        }
    }

    /// Persist the cached i-node of `slot` into its home block.
    pub fn flush_inode(&self, disk: &mut Disk, sb: &Superblock, slot: usize) -> Result<()> {
        let of = self.get(slot).ok_or(SfsError::BadDescriptor)?;
        inode::flush_dinode(disk, sb, of.inode, &of.dinode)
    }

    /// Live-slot accessor for the engine; `slot` must be live.
    pub(crate) fn entry(&self, slot: usize) -> &OpenFile {
        self.slots[slot].as_ref().expect("vacant fdt slot")
    }

    /// Live-slot accessor for the engine; `slot` must be live.
    pub(crate) fn entry_mut(&mut self, slot: usize) -> &mut OpenFile {
        self.slots[slot].as_mut().expect("vacant fdt slot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(inode: u32) -> OpenFile {
        OpenFile {
            inode,
            read_cursor: 0,
            write_cursor: 0,
            dinode: Dinode::new(false, inode),
        }
    }

    #[test]
    fn grows_and_shrinks_in_chunks() {
        let mut fdt = FileTable::new();
        let a = fdt.insert(dummy(1));
        let b = fdt.insert(dummy(2));
        let c = fdt.insert(dummy(3));
        let d = fdt.insert(dummy(4));
        assert_eq!((a, b, c, d), (0, 1, 2, 3));
        assert_eq!(fdt.slots.len(), 6);

        // A trailing all-vacant chunk is released; a live slot in the
        // chunk pins it.
        fdt.close(d);
        assert_eq!(fdt.slots.len(), 3);
        fdt.close(b);
        assert_eq!(fdt.slots.len(), 3);

        // Vacated low slots are reused first.
        assert_eq!(fdt.insert(dummy(5)), 1);

        fdt.close(0);
        fdt.close(1);
        fdt.close(2);
        assert_eq!(fdt.slots.len(), 0);
    }

    #[test]
    fn one_slot_per_inode() {
        let mut fdt = FileTable::new();
        let slot = fdt.insert(dummy(9));
        assert_eq!(fdt.find(9), Some(slot));
        assert_eq!(fdt.find(8), None);
    }
}
