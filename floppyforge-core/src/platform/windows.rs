use crate::device::Device;
use anyhow::{Result, anyhow};
use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::mem::{MaybeUninit, size_of};
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::debug;
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{
    DISK_GEOMETRY_EX, FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX,
};

/// Windows drives are addressed by letter only; discovery is not supported.
pub fn get_floppy_devices() -> Result<Vec<Device>> {
    Ok(Vec::new())
}

/// Resolves `A`/`B` to the raw volume path (`\\.\A:`).
pub fn resolve_drive(letter: &str) -> Result<PathBuf> {
    let letter = letter.trim().to_uppercase();
    match letter.as_str() {
        "A" | "B" => Ok(PathBuf::from(format!(r"\\.\{letter}:"))),
        other => Err(anyhow!("Invalid drive letter '{other}', expected A or B.")),
    }
}

/// Raw volume and physical drive paths live in the `\\.\` device namespace.
pub fn is_device_path(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().starts_with(r"\\.\")
}

fn device_io_control(file: &File, code: u32, out: *mut c_void, out_len: u32) -> io::Result<u32> {
    let mut returned = 0u32;
    // SAFETY: the handle is owned by `file`, there is no input buffer, and
    // `out` is either null with a zero length or points to `out_len` writable
    // bytes.
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as _,
            code,
            ptr::null(),
            0,
            out,
            out_len,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(returned)
    }
}

/// Returns `(capacity in bytes, logical sector size)` of an open volume.
pub fn block_device_geometry(file: &File) -> io::Result<(u64, u32)> {
    let mut geometry = MaybeUninit::<DISK_GEOMETRY_EX>::zeroed();
    device_io_control(
        file,
        IOCTL_DISK_GET_DRIVE_GEOMETRY_EX,
        geometry.as_mut_ptr().cast(),
        size_of::<DISK_GEOMETRY_EX>() as u32,
    )?;
    // SAFETY: zero is a valid bit pattern for every field and the ioctl
    // succeeded, so the struct is initialised.
    let geometry = unsafe { geometry.assume_init() };

    let capacity = u64::try_from(geometry.DiskSize).unwrap_or(0);
    if capacity == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "device size is reported as zero; is a disk inserted?",
        ));
    }
    let sector_size = match geometry.Geometry.BytesPerSector {
        0 => crate::device::DEFAULT_SECTOR_SIZE,
        n => n,
    };
    Ok((capacity, sector_size))
}

/// Locks the volume behind `file` and dismounts its filesystem. Both hold
/// until the handle is closed, so writes go to the raw media with nothing
/// else caching it.
pub fn lock_and_dismount(file: &File) -> io::Result<()> {
    device_io_control(file, FSCTL_LOCK_VOLUME, ptr::null_mut(), 0)?;
    device_io_control(file, FSCTL_DISMOUNT_VOLUME, ptr::null_mut(), 0)?;
    debug!("volume locked and dismounted");
    Ok(())
}

/// Nothing to do ahead of time: the volume is dismounted through the same
/// handle that writes it, see [`lock_and_dismount`].
pub fn unmount_best_effort(_device: &Path) {}
