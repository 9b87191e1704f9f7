//! Directory payloads and the current-directory cache.
//!
//! A directory is a regular i-node flagged as one. Its file content is a
//! parent back-pointer (`-1` at the root) followed by a packed sequence of
//! fixed-size `{name, i-node}` entries in insertion order; removal swaps
//! the tail entry into the freed slot and truncates one record.

use std::convert::TryInto;
use std::mem;
use std::str;

use itertools::Itertools;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::path::FileName;
use crate::param::MAXNAME;

/// Size of one on-disk directory entry.
pub const DIRENT_SIZE: usize = mem::size_of::<DirEntry>();

/// Size of the parent back-pointer at the head of the payload.
pub const PARENT_SIZE: usize = mem::size_of::<i32>();

/// The entry cache grows and shrinks in chunks of this many entries.
const ENTRY_CHUNK: usize = 5;

/// One `{name, i-node}` pair. The name is stored NUL-terminated in a
/// fixed buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct DirEntry {
    name: [u8; MAXNAME + 1],
    _pad: [u8; 3],
    inode: i32,
}

const_assert_eq!(mem::size_of::<DirEntry>(), 28);

impl DirEntry {
    pub fn new(name: FileName<'_>, inode: u32) -> DirEntry {
        let mut buf = [0u8; MAXNAME + 1];
        buf[..name.as_bytes().len()].copy_from_slice(name.as_bytes());
        DirEntry {
            name: buf,
            _pad: [0; 3],
            inode: inode as i32,
        }
    }

    pub fn inode(&self) -> u32 {
        self.inode as u32
    }

    /// Stored name, up to the NUL terminator.
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.name.len());
        str::from_utf8(&self.name[..len]).expect("directory entry name is not UTF-8")
    }

    pub fn matches(&self, name: FileName<'_>) -> bool {
        self.name() == name.as_str()
    }
}

/// Split a raw directory payload into the parent pointer and its entries.
pub fn parse_payload(payload: &[u8]) -> (i32, Vec<DirEntry>) {
    let parent = i32::from_ne_bytes(
        payload[..PARENT_SIZE]
            .try_into()
            .expect("parent back-pointer"),
    );
    let entries = payload[PARENT_SIZE..]
        .chunks_exact(DIRENT_SIZE)
        .map(|chunk| {
            let mut entry = DirEntry::default();
            entry.as_bytes_mut().copy_from_slice(chunk);
            entry
        })
        .collect();
    (parent, entries)
}

/// The one directory whose payload is resident in memory. Kept in sync
/// with the on-disk payload by the directory operations.
#[derive(Debug, Default)]
pub struct CurrentDir {
    /// Open-file slot of the loaded directory; `None` only while the root
    /// is being bootstrapped.
    pub slot: Option<usize>,
    /// I-node id of the parent directory, `-1` at the root.
    pub parent: i32,
    entries: Vec<DirEntry>,
}

impl CurrentDir {
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Rebuild the cache from a freshly read payload.
    pub fn reset(&mut self, slot: usize, parent: i32, entries: Vec<DirEntry>) {
        self.slot = Some(slot);
        self.parent = parent;
        self.entries = entries;
    }

    /// Index of the entry named `name`.
    pub fn find(&self, name: FileName<'_>) -> Option<usize> {
        self.entries
            .iter()
            .find_position(|entry| entry.matches(name))
            .map(|(index, _)| index)
    }

    /// Append an entry, growing the cache by whole chunks.
    pub fn push(&mut self, entry: DirEntry) {
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve_exact(ENTRY_CHUNK);
        }
        self.entries.push(entry);
    }

    /// Remove the entry at `index` by swapping the tail into its place.
    /// Returns the removed entry and the moved tail, if any; slack beyond
    /// a whole chunk is given back.
    pub fn remove_via_tail(&mut self, index: usize) -> (DirEntry, Option<DirEntry>) {
        let removed = self.entries[index];
        let tail = self.entries.pop().expect("empty directory cache");
        let moved = if index < self.entries.len() {
            self.entries[index] = tail;
            Some(tail)
        } else {
            None
        };
        if self.entries.capacity() >= self.entries.len() + ENTRY_CHUNK
            && self.entries.capacity() > ENTRY_CHUNK
        {
            let target = self.entries.capacity() - ENTRY_CHUNK;
            self.entries.shrink_to(target);
        }
        (removed, moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> FileName<'_> {
        FileName::new(s).unwrap()
    }

    #[test]
    fn entry_stores_name_nul_terminated() {
        let entry = DirEntry::new(name("notes.txt"), 7);
        assert_eq!(entry.name(), "notes.txt");
        assert_eq!(entry.inode(), 7);
        assert!(entry.matches(name("notes.txt")));
        assert!(!entry.matches(name("notes")));

        // A maximum-length name still leaves its terminator in place.
        let long = "12345678901234567890";
        assert_eq!(DirEntry::new(name(long), 1).name(), long);
    }

    #[test]
    fn payload_round_trip() {
        let entries = [
            DirEntry::new(name("a"), 1),
            DirEntry::new(name("bb"), 2),
            DirEntry::new(name("ccc"), 3),
        ];
        let mut payload = Vec::new();
        payload.extend_from_slice(&5i32.to_ne_bytes());
        for entry in &entries {
            payload.extend_from_slice(entry.as_bytes());
        }

        let (parent, back) = parse_payload(&payload);
        assert_eq!(parent, 5);
        assert_eq!(back.len(), 3);
        assert_eq!(back[1].name(), "bb");
        assert_eq!(back[2].inode(), 3);
    }

    #[test]
    fn remove_swaps_tail_into_hole() {
        let mut dir = CurrentDir::default();
        for (i, n) in ["a", "b", "c"].iter().enumerate() {
            dir.push(DirEntry::new(name(n), i as u32));
        }

        let (removed, moved) = dir.remove_via_tail(0);
        assert_eq!(removed.name(), "a");
        assert_eq!(moved.unwrap().name(), "c");
        assert_eq!(dir.entries()[0].name(), "c");
        assert_eq!(dir.find(name("b")), Some(1));
        assert_eq!(dir.find(name("a")), None);

        // Removing the tail itself moves nothing.
        let (removed, moved) = dir.remove_via_tail(1);
        assert_eq!(removed.name(), "b");
        assert!(moved.is_none());
    }
}
