//! Provides platform-specific functionality.
//!
//! This module holds what the rest of the crate cannot do portably:
//! discovering floppy drives, resolving drive letters, querying block device
//! geometry and releasing mounts before a destructive job.
//!
//! Each submodule exposes the same API:
//! - `get_floppy_devices() -> anyhow::Result<Vec<Device>>`
//! - `resolve_drive(letter) -> anyhow::Result<PathBuf>`
//! - `block_device_geometry(&File) -> io::Result<(u64, u32)>`
//! - `unmount_best_effort(&Path)`
//!
//! Windows additionally has `is_device_path` and `lock_and_dismount`, which
//! raw volume handles need before they can be written.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
