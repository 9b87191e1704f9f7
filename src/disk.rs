//! Raw block device emulated over an ordinary backing file.
//!
//! Synchronous, whole-block transfers, no caching; any buffering lives
//! above it. Dropping the handle releases the backing file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;

/// Handle to an open virtual disk of fixed geometry.
#[derive(Debug)]
pub struct Disk {
    file: File,
    block_size: usize,
    nblocks: usize,
}

impl Disk {
    /// Create a zeroed backing file of `nblocks` blocks, clobbering any
    /// previous content.
    pub fn format<P: AsRef<Path>>(path: P, block_size: usize, nblocks: usize) -> Result<Disk> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((block_size * nblocks) as u64)?;
        Ok(Disk {
            file,
            block_size,
            nblocks,
        })
    }

    /// Open an existing backing file.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize, nblocks: usize) -> Result<Disk> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Disk {
            file,
            block_size,
            nblocks,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Read whole blocks starting at `start` into `buf`, whose length must
    /// be a multiple of the block size.
    pub fn read_blocks(&mut self, start: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(start, buf.len())?;
        self.file
            .seek(SeekFrom::Start((start * self.block_size) as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write whole blocks starting at `start` from `buf`, whose length must
    /// be a multiple of the block size.
    pub fn write_blocks(&mut self, start: usize, buf: &[u8]) -> Result<()> {
        self.check_range(start, buf.len())?;
        self.file
            .seek(SeekFrom::Start((start * self.block_size) as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn check_range(&self, start: usize, len: usize) -> Result<()> {
        if len == 0 || len % self.block_size != 0 || start + len / self.block_size > self.nblocks {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "transfer outside device bounds",
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = Disk::format(&path, 64, 8).unwrap();

        let data = [0xabu8; 128];
        disk.write_blocks(3, &data).unwrap();

        let mut back = [0u8; 128];
        disk.read_blocks(3, &mut back).unwrap();
        assert_eq!(back, data);

        // A fresh device reads as zeros.
        let mut zeroed = [0xffu8; 64];
        disk.read_blocks(0, &mut zeroed).unwrap();
        assert!(zeroed.iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_out_of_range_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = Disk::format(&path, 64, 8).unwrap();

        let mut buf = [0u8; 128];
        assert!(disk.read_blocks(7, &mut buf).is_err());
        assert!(disk.write_blocks(8, &buf[..64]).is_err());
        assert!(disk.read_blocks(0, &mut buf[..32]).is_err());
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut disk = Disk::format(&path, 64, 8).unwrap();
        disk.write_blocks(5, &[7u8; 64]).unwrap();
        drop(disk);

        let mut disk = Disk::open(&path, 64, 8).unwrap();
        let mut back = [0u8; 64];
        disk.read_blocks(5, &mut back).unwrap();
        assert_eq!(back, [7u8; 64]);
    }
}
