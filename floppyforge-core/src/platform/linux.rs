use crate::device::Device;
use crate::floppy::FloppyFormat;
use anyhow::{Result, anyhow};
use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

mod ioctl {
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    nix::ioctl_read_bad!(blksszget, nix::request_code_none!(0x12, 104), libc::c_int);
}

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.find('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

fn mount_point_of(disks: &sysinfo::Disks, device_name: &str) -> String {
    disks
        .iter()
        .filter(|disk| {
            Path::new(disk.name())
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(device_name))
        })
        .map(|disk| disk.mount_point().to_string_lossy().to_string())
        .find(|mp| !mp.is_empty())
        .unwrap_or_default()
}

/// Scans for floppy drives on a Linux system.
///
/// Two kinds of device qualify:
/// 1.  Legacy controller drives (`fd0`, `fd1`), whatever their size flag says.
/// 2.  Removable, writable whole disks whose size is a floppy geometry, which
///     is how USB floppy drives show up (`sdX`).
///
/// The disk holding `/` is never returned.
pub fn get_floppy_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())));

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || Some(&device_path) == system_disk_parent.as_ref() {
            continue;
        }

        let size_bytes = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
            * 512;

        let is_legacy_floppy = device_name.starts_with("fd");
        if !is_legacy_floppy {
            let removable = read_sys_file(&device_name, "removable").is_ok_and(|s| s == "1");
            let read_only = read_sys_file(&device_name, "ro").is_ok_and(|s| s == "1");
            if !removable || read_only || FloppyFormat::from_size(size_bytes).is_none() {
                continue;
            }
        }

        devices.push(Device {
            mount_point: mount_point_of(&disks, &device_name),
            path: device_path,
            name: device_name,
            size_bytes,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// Resolves a DOS-style drive letter to a device node.
///
/// `A` maps to `/dev/fd0` and `B` to `/dev/fd1` (or their `/dev/floppy/N`
/// aliases). When neither exists the first floppy-sized removable disk is
/// used instead.
pub fn resolve_drive(letter: &str) -> Result<PathBuf> {
    let letter = letter.trim().to_uppercase();
    let candidates: &[&str] = match letter.as_str() {
        "A" => &["/dev/fd0", "/dev/floppy/0"],
        "B" => &["/dev/fd1", "/dev/floppy/1"],
        other => return Err(anyhow!("Invalid drive letter '{other}', expected A or B.")),
    };

    if let Some(path) = candidates.iter().map(PathBuf::from).find(|p| p.exists()) {
        return Ok(path);
    }

    get_floppy_devices()?
        .into_iter()
        .find(|d| !d.name.starts_with("fd"))
        .map(|d| d.path)
        .ok_or_else(|| anyhow!("No floppy drive found for {letter}:. Insert a disk and retry."))
}

/// Returns `(capacity in bytes, logical sector size)` of an open block device.
pub fn block_device_geometry(file: &File) -> io::Result<(u64, u32)> {
    let fd = file.as_raw_fd();
    let mut capacity: u64 = 0;
    let mut sector_size: libc::c_int = 0;
    // SAFETY: `fd` is an open descriptor owned by `file` and both out-pointers
    // refer to live, correctly typed locals.
    unsafe {
        ioctl::blkgetsize64(fd, &mut capacity).map_err(io::Error::from)?;
        ioctl::blksszget(fd, &mut sector_size).map_err(io::Error::from)?;
    }

    if capacity == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "device size is reported as zero; is a disk inserted?",
        ));
    }
    let sector_size = u32::try_from(sector_size)
        .ok()
        .filter(|s| *s > 0)
        .unwrap_or(crate::device::DEFAULT_SECTOR_SIZE);
    Ok((capacity, sector_size))
}

/// Unmounts every filesystem mounted from `device` or one of its partitions.
/// Failures are logged, not returned: the exclusive open that follows is what
/// actually refuses a device still in use.
pub fn unmount_best_effort(device: &Path) {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let device_str = device.to_string_lossy();

    for disk in disks.iter() {
        let disk_path = PathBuf::from("/dev/").join(disk.name());
        if !disk_path.to_string_lossy().starts_with(device_str.as_ref()) {
            continue;
        }
        let mount_point = disk.mount_point();
        match nix::mount::umount(mount_point) {
            Ok(()) => info!(mount_point = %mount_point.display(), "unmounted"),
            Err(e) => warn!(mount_point = %mount_point.display(), error = %e, "unmount failed"),
        }
    }
    debug!(device = %device.display(), "unmount pass complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_paths_resolve_to_parent_disk() {
        assert_eq!(get_parent_device_path(Path::new("/dev/sda1")), PathBuf::from("/dev/sda"));
        assert_eq!(
            get_parent_device_path(Path::new("/dev/nvme0n1p2")),
            PathBuf::from("/dev/nvme0n1")
        );
        assert_eq!(get_parent_device_path(Path::new("/dev/fd0")), PathBuf::from("/dev/fd0"));
    }

    #[test]
    fn unknown_drive_letter_is_rejected() {
        assert!(resolve_drive("Q").is_err());
    }
}
