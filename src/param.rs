/// Default block size in bytes.
pub const BSIZE: u32 = 1024;

/// Default filesystem size in blocks.
pub const FSSIZE: u32 = 1024;

/// Default number of blocks reserved for the i-node table.
pub const NINODEBLOCKS: u32 = 48;

/// Maximum file name length, not counting the NUL terminator.
pub const MAXNAME: usize = 20;

/// Path separator.
pub const SEPARATOR: char = '\\';

/// Default name of the disk backing file.
pub const DISKNAME: &str = "fs.sfs";

/// Name of the root directory.
pub const ROOTNAME: &str = "root";
