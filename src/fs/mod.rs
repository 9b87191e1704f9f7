//! Filesystem implementation. Five layers, leaves first:
//!   + Blocks: free-space bitmap over the raw virtual disk.
//!   + I-nodes: block-address trees; reading, writing, deleting ranges.
//!   + Open files: cached i-nodes with independent read/write cursors.
//!   + Directories: i-nodes with special contents (lists of other i-nodes!)
//!   + Names: `\`-separated paths resolved from the root directory.
//!
//! This module owns the mounted aggregate, [`Sfs`]; the lower layers live
//! in the submodules. The public methods double as the API shim: argument
//! validation and name resolution happen here, and the two cursors of a
//! data file are kept in lock-step the way the legacy interface did (a
//! write's end becomes the read position and vice versa). The engine
//! underneath keeps the cursors independent so the directory layer can
//! move them freely.

pub mod bitmap;
pub mod directory;
pub mod fdt;
pub mod inode;
pub mod path;
pub mod superblock;

use std::mem;
use std::path::Path as OsPath;

use log::warn;
use zerocopy::AsBytes;

use self::bitmap::FreeBitmap;
use self::directory::{CurrentDir, DirEntry, DIRENT_SIZE, PARENT_SIZE};
use self::fdt::{FileTable, OpenFile};
use self::inode::Dinode;
use self::path::{FileName, Path};
use self::superblock::{DiskGeometry, Superblock};
use crate::disk::Disk;
use crate::error::{Result, SfsError};
use crate::param::ROOTNAME;

/// Handle to an open file: an index into the open-file table.
pub type Fd = usize;

/// A mounted filesystem: the block device plus every in-memory cache.
///
/// Dropping the value releases the device; mounting again afterwards
/// picks the persisted state back up.
#[derive(Debug)]
pub struct Sfs {
    disk: Disk,
    superblock: Superblock,
    bitmap: FreeBitmap,
    fdt: FileTable,
    cwd: CurrentDir,
    last_file_id: u32,
}

impl Sfs {
    /// Create a fresh filesystem on `path` with the default geometry,
    /// clobbering whatever was there.
    pub fn format<P: AsRef<OsPath>>(path: P) -> Result<Sfs> {
        Sfs::format_with(path, DiskGeometry::default())
    }

    /// Create a fresh filesystem on `path` with the given geometry.
    pub fn format_with<P: AsRef<OsPath>>(path: P, geometry: DiskGeometry) -> Result<Sfs> {
        debug_assert!(geometry.block_size as usize >= mem::size_of::<Dinode>());
        debug_assert!(geometry.block_size % 4 == 0);
        debug_assert!(geometry.fs_blocks >= geometry.inode_blocks + 3);

        let superblock = Superblock::new(geometry);
        let disk = Disk::format(
            path,
            geometry.block_size as usize,
            geometry.fs_blocks as usize,
        )?;
        let bitmap = FreeBitmap::new(&superblock);
        let mut fs = Sfs {
            disk,
            superblock,
            bitmap,
            fdt: FileTable::new(),
            cwd: CurrentDir::default(),
            last_file_id: 0,
        };
        fs.bitmap.flush(&mut fs.disk)?;

        // The root is the only directory created without a parent entry;
        // its back-pointer is -1 and its name lives nowhere on disk.
        let root = fs.create_entry(FileName::new(ROOTNAME)?, true)?;
        fs.superblock.root_inode = fs.fdt.entry(root).inode as i32;
        fs.superblock.save(&mut fs.disk)?;
        fs.load_dir(fs.superblock.root_inode as u32, true)?;
        Ok(fs)
    }

    /// Mount the filesystem persisted on `path`. A magic mismatch refuses
    /// the mount outright.
    pub fn mount<P: AsRef<OsPath>>(path: P) -> Result<Sfs> {
        // The superblock dictates the real geometry, so probe it through a
        // minimal one-block view of the device first.
        let mut probe = Disk::open(&path, mem::size_of::<Superblock>(), 1)?;
        let superblock = Superblock::load(&mut probe)?;
        drop(probe);

        let mut disk = Disk::open(
            &path,
            superblock.block_size as usize,
            superblock.fs_size as usize,
        )?;
        let bitmap = FreeBitmap::load(&superblock, &mut disk)?;
        let last_file_id = highest_file_id(&mut disk, &superblock, &bitmap)?;
        let mut fs = Sfs {
            disk,
            superblock,
            bitmap,
            fdt: FileTable::new(),
            cwd: CurrentDir::default(),
            last_file_id,
        };
        fs.load_dir(fs.superblock.root_inode as u32, true)?;
        Ok(fs)
    }

    /// Size in bytes of the file at a root-relative `path`.
    pub fn file_size(&mut self, path: &str) -> Result<u64> {
        let (slot, newly) = self.open_path(Path::new(path))?;
        let size = self.fdt.entry(slot).dinode.size;
        // Restoring the directory may have adopted the freshly opened
        // slot as the current one; that slot stays.
        if newly && Some(slot) != self.cwd.slot {
            self.fdt.close(slot);
        }
        Ok(size)
    }

    /// Create an empty subdirectory in the current directory.
    pub fn mkdir(&mut self, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        if self.cwd.find(name).is_some() {
            return Err(SfsError::NameCollision);
        }
        let slot = self.create_entry(name, true)?;
        self.fdt.close(slot);
        Ok(())
    }

    /// Change the current directory to the named subdirectory, or to the
    /// parent with `".."`. The parent of the root does not exist.
    pub fn chdir(&mut self, name: &str) -> Result<()> {
        if name == ".." {
            let parent = self.cwd.parent;
            if parent < 0 {
                return Err(SfsError::NoSuchEntry);
            }
            return self.load_dir(parent as u32, true);
        }
        let name = FileName::new(name)?;
        let index = self.cwd.find(name).ok_or(SfsError::NoSuchEntry)?;
        let inode = self.cwd.entries()[index].inode();
        self.load_dir(inode, true)
    }

    /// Open `name` in the current directory, creating it when absent.
    /// Directories cannot be opened as data files.
    pub fn open(&mut self, name: &str) -> Result<Fd> {
        let name = FileName::new(name)?;
        match self.cwd.find(name) {
            Some(index) => {
                let inode = self.cwd.entries()[index].inode();
                let (slot, newly) = self.fdt.open(&mut self.disk, &self.superblock, inode)?;
                if self.fdt.entry(slot).dinode.is_directory() {
                    if newly {
                        self.fdt.close(slot);
                    }
                    return Err(SfsError::IsADirectory);
                }
                Ok(slot)
            }
            None => self.create_entry(name, false),
        }
    }

    /// Release an open file. Closing never deletes anything.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.data_fd(fd)?;
        self.fdt.close(fd);
        Ok(())
    }

    /// Read from the read cursor, clamped to the end of the file. The
    /// write cursor follows the read position.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.data_fd(fd)?;
        let of = self.fdt.entry_mut(fd);
        let n = inode::read_data(&mut self.disk, &self.superblock, of, buf)?;
        of.write_cursor = of.read_cursor;
        Ok(n)
    }

    /// Write at the write cursor, clamped to what the file and the data
    /// region can hold. The read cursor follows the write position.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize> {
        self.data_fd(fd)?;
        let of = self.fdt.entry_mut(fd);
        let n = inode::overwrite_data(&mut self.disk, &mut self.bitmap, &self.superblock, of, buf)?;
        of.read_cursor = of.write_cursor;
        Ok(n)
    }

    /// Delete up to `n` bytes immediately before the write cursor,
    /// shifting the rest of the file back. Returns the bytes deleted.
    pub fn delete_range(&mut self, fd: Fd, n: u64) -> Result<u64> {
        self.data_fd(fd)?;
        let of = self.fdt.entry_mut(fd);
        let deleted = inode::delete_data(&mut self.disk, &mut self.bitmap, &self.superblock, of, n)?;
        of.read_cursor = of.write_cursor;
        Ok(deleted)
    }

    /// Move both cursors to `pos`. The end of the file is a valid target,
    /// so a fresh seek can set up an append.
    pub fn seek(&mut self, fd: Fd, pos: u64) -> Result<()> {
        self.data_fd(fd)?;
        let of = self.fdt.entry_mut(fd);
        if pos > of.dinode.size {
            return Err(SfsError::SeekOutOfRange);
        }
        of.read_cursor = pos;
        of.write_cursor = pos;
        Ok(())
    }

    /// Remove `name` from the current directory, releasing everything the
    /// target owns; a directory is emptied recursively first.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        self.remove_entry(name)?;
        Ok(())
    }

    /// Names in the current directory, in cache order. The borrow ties
    /// the iteration to the directory it was started on.
    pub fn file_names(&self) -> FileNames<'_> {
        FileNames {
            entries: self.cwd.entries().iter(),
        }
    }

    /// Number of live i-nodes on the disk.
    pub fn file_count(&self) -> u32 {
        self.bitmap.allocated_inodes()
    }

    /// Number of data-region blocks currently allocated.
    pub fn used_blocks(&self) -> u32 {
        self.bitmap.allocated_data()
    }

    /// A data-file descriptor: in range, live, and not a directory.
    fn data_fd(&self, fd: Fd) -> Result<()> {
        match self.fdt.get(fd) {
            Some(of) if of.dinode.is_directory() => Err(SfsError::IsADirectory),
            Some(_) => Ok(()),
            None => Err(SfsError::BadDescriptor),
        }
    }

    /// Allocate a fresh i-node and leave it open.
    fn create_inode(&mut self, is_directory: bool) -> Result<usize> {
        let id = self.bitmap.alloc_inode().ok_or(SfsError::NoFreeInodes)?;
        self.bitmap.flush(&mut self.disk)?;
        self.last_file_id += 1;
        let dinode = Dinode::new(is_directory, self.last_file_id);
        let slot = self.fdt.insert(OpenFile {
            inode: id,
            read_cursor: 0,
            write_cursor: 0,
            dinode,
        });
        self.fdt.flush_inode(&mut self.disk, &self.superblock, slot)?;
        Ok(slot)
    }

    /// Free an open i-node: the block tree, then the table bit, then the
    /// slot. The only way an i-node dies; a close never implies this.
    fn delete_inode(&mut self, slot: usize) -> Result<()> {
        let of = self.fdt.entry_mut(slot);
        inode::free_tree(&mut self.disk, &mut self.bitmap, &self.superblock, &mut of.dinode)?;
        let id = of.inode;
        self.bitmap.free_inode(id);
        self.bitmap.flush(&mut self.disk)?;
        self.fdt.close(slot);
        Ok(())
    }

    /// Make `inode` the current directory, optionally releasing the
    /// previous one. Loading the already-current directory is a no-op.
    fn load_dir(&mut self, inode: u32, close_previous: bool) -> Result<()> {
        if let Some(slot) = self.cwd.slot {
            if self.fdt.entry(slot).inode == inode {
                return Ok(());
            }
        }
        let (slot, newly) = self.fdt.open(&mut self.disk, &self.superblock, inode)?;
        if !self.fdt.entry(slot).dinode.is_directory() {
            warn!("i-node {} is not a directory; load cancelled", inode);
            if newly {
                self.fdt.close(slot);
            }
            return Err(SfsError::NotADirectory);
        }
        if close_previous {
            if let Some(previous) = self.cwd.slot {
                self.fdt.close(previous);
            }
        }

        let of = self.fdt.entry_mut(slot);
        of.read_cursor = 0;
        let mut payload = vec![0u8; of.dinode.size as usize];
        inode::read_data(&mut self.disk, &self.superblock, of, &mut payload)?;
        of.read_cursor = 0;
        of.write_cursor = of.dinode.size;

        let (parent, entries) = directory::parse_payload(&payload);
        self.cwd.reset(slot, parent, entries);
        Ok(())
    }

    /// Create `name` in the current directory and leave it open. A fresh
    /// directory gets its parent back-pointer written before the entry
    /// goes in.
    fn create_entry(&mut self, name: FileName<'_>, is_directory: bool) -> Result<usize> {
        let slot = self.create_inode(is_directory)?;
        if is_directory {
            let parent = match self.cwd.slot {
                Some(current) => self.fdt.entry(current).inode as i32,
                None => -1,
            };
            let of = self.fdt.entry_mut(slot);
            let n = inode::overwrite_data(
                &mut self.disk,
                &mut self.bitmap,
                &self.superblock,
                of,
                &parent.to_ne_bytes(),
            )?;
            if n < PARENT_SIZE {
                self.delete_inode(slot)?;
                return Err(SfsError::NoFreeBlocks);
            }
        }

        let current = match self.cwd.slot {
            Some(current) => current,
            // Bootstrapping the root: no directory to list it in.
            None => return Ok(slot),
        };

        let entry = DirEntry::new(name, self.fdt.entry(slot).inode);
        let of = self.fdt.entry_mut(current);
        debug_assert_eq!(of.write_cursor, of.dinode.size);
        let n = inode::overwrite_data(
            &mut self.disk,
            &mut self.bitmap,
            &self.superblock,
            of,
            entry.as_bytes(),
        )?;
        if n < DIRENT_SIZE {
            // A torn entry must not survive; back the partial bytes out
            // and give the fresh i-node back.
            inode::delete_data(
                &mut self.disk,
                &mut self.bitmap,
                &self.superblock,
                self.fdt.entry_mut(current),
                n as u64,
            )?;
            self.delete_inode(slot)?;
            return Err(SfsError::NoFreeBlocks);
        }
        self.cwd.push(entry);
        Ok(slot)
    }

    /// Open the named entry of the current directory.
    fn open_entry(&mut self, name: FileName<'_>) -> Result<(usize, bool)> {
        let index = self.cwd.find(name).ok_or(SfsError::NoSuchEntry)?;
        let inode = self.cwd.entries()[index].inode();
        self.fdt.open(&mut self.disk, &self.superblock, inode)
    }

    /// Remove `name` from the current directory, deleting the i-node when
    /// its last link goes away; otherwise only the entry disappears.
    fn remove_entry(&mut self, name: FileName<'_>) -> Result<DirEntry> {
        let index = self.cwd.find(name).ok_or(SfsError::NoSuchEntry)?;
        let inode = self.cwd.entries()[index].inode();
        let (slot, newly) = self.fdt.open(&mut self.disk, &self.superblock, inode)?;
        let nlink = {
            let of = self.fdt.entry_mut(slot);
            of.dinode.nlink = of.dinode.nlink.saturating_sub(1);
            of.dinode.nlink
        };
        if nlink == 0 {
            self.remove_at(index, true)
        } else {
            self.fdt.flush_inode(&mut self.disk, &self.superblock, slot)?;
            let removed = self.remove_at(index, false)?;
            if newly {
                self.fdt.close(slot);
            }
            Ok(removed)
        }
    }

    /// Remove the entry at `index` from the current directory,
    /// recursively deleting subdirectory contents when `delete_data` is
    /// set. On disk the tail entry swaps into the hole and the payload
    /// shrinks by one record.
    fn remove_at(&mut self, index: usize, delete_data: bool) -> Result<DirEntry> {
        let target = self.cwd.entries()[index];
        let (slot, _) = self
            .fdt
            .open(&mut self.disk, &self.superblock, target.inode())?;

        if delete_data {
            if self.fdt.entry(slot).dinode.is_directory() {
                // Descend without closing the parent, empty the
                // subdirectory from the tail (each removal is then an O(1)
                // cache update), and climb back up.
                self.load_dir(target.inode(), false)?;
                while !self.cwd.entries().is_empty() {
                    let last = self.cwd.entries().len() - 1;
                    self.remove_at(last, true)?;
                }
                let parent = self.cwd.parent;
                self.load_dir(parent as u32, false)?;
            }
            self.delete_inode(slot)?;
        }

        let current = self.cwd.slot.expect("no current directory");
        let old_wp = self.fdt.entry(current).write_cursor;
        let (removed, moved) = self.cwd.remove_via_tail(index);
        debug_assert_eq!(removed.inode(), target.inode());

        if let Some(tail) = moved {
            // Swap-with-tail on disk: one positioned entry overwrite.
            let of = self.fdt.entry_mut(current);
            of.write_cursor = (PARENT_SIZE + index * DIRENT_SIZE) as u64;
            inode::overwrite_data(
                &mut self.disk,
                &mut self.bitmap,
                &self.superblock,
                of,
                tail.as_bytes(),
            )?;
        }

        let of = self.fdt.entry_mut(current);
        of.write_cursor = of.dinode.size;
        inode::delete_data(
            &mut self.disk,
            &mut self.bitmap,
            &self.superblock,
            of,
            DIRENT_SIZE as u64,
        )?;
        let of = self.fdt.entry_mut(current);
        if old_wp < of.write_cursor {
            of.write_cursor = old_wp;
        }
        Ok(removed)
    }

    /// Open the file at a root-relative path, restoring the previously
    /// loaded directory before returning.
    fn open_path(&mut self, path: Path<'_>) -> Result<(usize, bool)> {
        let saved = self
            .fdt
            .entry(self.cwd.slot.expect("no current directory"))
            .inode;
        let walked = self.walk_path(path);
        let restored = self.load_dir(saved, true);
        let opened = walked?;
        restored?;
        Ok(opened)
    }

    fn walk_path(&mut self, path: Path<'_>) -> Result<(usize, bool)> {
        self.load_dir(self.superblock.root_inode as u32, true)?;
        for component in path.dirs() {
            let component = FileName::new(component)?;
            let index = self.cwd.find(component).ok_or(SfsError::NoSuchEntry)?;
            let inode = self.cwd.entries()[index].inode();
            self.load_dir(inode, true)?;
        }
        self.open_entry(FileName::new(path.name())?)
    }
}

/// Iterator over the names of the current directory.
///
/// Replaces the legacy "1 if written, 0 at end" callback with its hidden
/// cursor; callers that need that convention can wrap the iterator.
#[derive(Debug)]
pub struct FileNames<'a> {
    entries: std::slice::Iter<'a, DirEntry>,
}

impl<'a> Iterator for FileNames<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        self.entries.next().map(DirEntry::name)
    }
}

/// Largest file id still present on disk; the monotonic counter restarts
/// past it on mount.
fn highest_file_id(disk: &mut Disk, sb: &Superblock, bitmap: &FreeBitmap) -> Result<u32> {
    let per_block = sb.inodes_per_block();
    let mut buf = vec![0u8; sb.block_size as usize];
    let mut max = 0;
    for block in 0..sb.inode_blocks as usize {
        disk.read_blocks(1 + block, &mut buf)?;
        for slot in 0..per_block {
            let id = (block * per_block + slot) as u32;
            if !bitmap.inode_allocated(id) {
                continue;
            }
            let off = slot * mem::size_of::<Dinode>();
            let mut record = Dinode::default();
            record
                .as_bytes_mut()
                .copy_from_slice(&buf[off..off + mem::size_of::<Dinode>()]);
            max = max.max(record.file_id);
        }
    }
    Ok(max)
}
