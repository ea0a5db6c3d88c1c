//! Block device targets.
//!
//! [`BlockDevice`] is the seam between the transfer engine and storage. The
//! engine only ever issues sector-aligned positioned writes; implementations
//! may complete fewer bytes than requested and the engine loops over the rest.
//!
//! - [`RawDevice`] talks to an OS device node (or a regular file).
//! - [`MemoryDevice`] keeps its sectors in memory and can inject faults.
//!
//! [`Device`] describes a candidate target found by [`crate::platform`].
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::floppy::FloppyFormat;

mod memory;
mod raw;

pub use memory::{MemoryDevice, WriteRecord};
pub use raw::{Access, RawDevice};

/// Sector size assumed for targets that cannot report one.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

pub trait BlockDevice: Send {
    /// Platform path identifying the device. Used as the lock key.
    fn path(&self) -> &Path;

    /// Usable size in bytes.
    fn capacity(&self) -> u64;

    /// Native sector size in bytes.
    fn sector_size(&self) -> u32;

    /// Writes `buf` at `offset`, returning how many bytes were accepted.
    /// A short count is not an error.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Reads into `buf` from `offset`, returning how many bytes were read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Pushes buffered writes to the medium.
    fn flush(&mut self) -> io::Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn path(&self) -> &Path {
        (**self).path()
    }

    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        (**self).write_at(offset, buf)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// A removable block device discovered on the system.
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/fd0` or `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "fd0").
    pub name: String,
    /// Capacity in bytes.
    pub size_bytes: u64,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl Device {
    pub fn format(&self) -> Option<FloppyFormat> {
        FloppyFormat::from_size(self.size_bytes)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = match self.format() {
            Some(format) => format.to_string(),
            None => format!("{} bytes", self.size_bytes),
        };
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };

        write!(f, "{:<15} {:<20} {}", self.path.display(), format, mount_info)
    }
}
