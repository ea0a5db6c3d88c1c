use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{BlockDevice, DEFAULT_SECTOR_SIZE};
use crate::error::TransferError;
use crate::os_options::OpenOptionsExt;
use crate::platform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// A device node or regular file opened for raw, positioned I/O.
///
/// On Unix writes go through `O_SYNC`, and block devices are opened with
/// `O_EXCL` so that a mounted or otherwise claimed device is refused with
/// `EBUSY` instead of being written underneath its filesystem. On Windows a
/// raw volume (`\\.\A:`) opened for writing is locked and dismounted
/// through its own handle for the same reason.
#[derive(Debug)]
pub struct RawDevice {
    file: File,
    path: PathBuf,
    capacity: u64,
    sector_size: u32,
}

impl RawDevice {
    pub fn open(path: &Path, access: Access) -> Result<Self, TransferError> {
        let is_block = is_block_device(path).map_err(|e| TransferError::from_open(path, e))?;

        let mut options = OpenOptions::new();
        options.read(true).write(access == Access::ReadWrite);
        options.custom_flags(open_flags(is_block, access));
        let file = options
            .open(path)
            .map_err(|e| TransferError::from_open(path, e))?;

        #[cfg(windows)]
        if is_block && access == Access::ReadWrite {
            platform::lock_and_dismount(&file).map_err(|e| {
                warn!(path = %path.display(), error = %e, "could not lock volume");
                TransferError::DeviceBusy {
                    path: path.to_path_buf(),
                }
            })?;
        }

        let (capacity, sector_size) = if is_block {
            platform::block_device_geometry(&file)
                .map_err(|e| TransferError::from_open(path, e))?
        } else {
            let len = file
                .metadata()
                .map_err(|e| TransferError::from_open(path, e))?
                .len();
            (len, DEFAULT_SECTOR_SIZE)
        };
        debug!(
            path = %path.display(),
            capacity,
            sector_size,
            is_block,
            "opened raw device"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            capacity,
            sector_size,
        })
    }
}

impl BlockDevice for RawDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        positioned::write_at(&self.file, buf, offset)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        positioned::read_at(&self.file, buf, offset)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.sync_all() {
            Ok(()) => Ok(()),
            // USB floppy drivers commonly reject the flush request outright.
            Err(e) if flush_unsupported(&e) => {
                warn!(path = %self.path.display(), error = %e, "device rejected flush, ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn open_flags(is_block: bool, access: Access) -> i32 {
    let mut flags = 0;
    if access == Access::ReadWrite {
        flags |= libc::O_SYNC;
    }
    if is_block {
        flags |= libc::O_EXCL;
    }
    flags
}

#[cfg(windows)]
fn open_flags(_is_block: bool, _access: Access) -> u32 {
    0
}

#[cfg(unix)]
fn is_block_device(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;
    Ok(std::fs::metadata(path)?.file_type().is_block_device())
}

#[cfg(windows)]
fn is_block_device(path: &Path) -> io::Result<bool> {
    Ok(platform::is_device_path(path))
}

#[cfg(unix)]
fn flush_unsupported(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOTTY))
}

#[cfg(windows)]
fn flush_unsupported(err: &io::Error) -> bool {
    use windows_sys::Win32::Foundation::ERROR_INVALID_FUNCTION;
    err.raw_os_error().is_some_and(|code| code as u32 == ERROR_INVALID_FUNCTION)
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub(super) fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        file.write_at(buf, offset)
    }

    pub(super) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        file.read_at(buf, offset)
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub(super) fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        file.seek_write(buf, offset)
    }

    pub(super) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        file.seek_read(buf, offset)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn regular_file_target_reports_length_and_default_sectors() {
        let target = NamedTempFile::new().unwrap();
        target.as_file().set_len(8192).unwrap();

        let mut device = RawDevice::open(target.path(), Access::ReadWrite).unwrap();
        assert_eq!(device.capacity(), 8192);
        assert_eq!(device.sector_size(), DEFAULT_SECTOR_SIZE);

        assert_eq!(device.write_at(512, &[0xEE; 512]).unwrap(), 512);
        device.flush().unwrap();

        let mut back = [0u8; 512];
        assert_eq!(device.read_at(512, &mut back).unwrap(), 512);
        assert!(back.iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn rejected_flush_is_tolerated_but_real_failures_are_not() {
        assert!(flush_unsupported(&io::Error::from_raw_os_error(libc::EINVAL)));
        assert!(flush_unsupported(&io::Error::from_raw_os_error(libc::ENOTTY)));
        assert!(!flush_unsupported(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(!flush_unsupported(&io::Error::from_raw_os_error(libc::ENOSPC)));
        assert!(!flush_unsupported(&io::Error::other("no errno")));
    }

    #[test]
    fn missing_path_is_device_not_found() {
        let err = RawDevice::open(Path::new("/nonexistent/fd7"), Access::ReadOnly).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DeviceNotFound);
    }
}
