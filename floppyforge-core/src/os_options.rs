//! `custom_flags` for [`std::fs::OpenOptions`] on every supported platform.
//!
//! Unix takes `O_*` flags as `i32`, Windows takes `FILE_FLAG_*` as `u32`.
#[cfg(unix)]
pub(crate) use std::os::unix::fs::OpenOptionsExt;

#[cfg(windows)]
pub(crate) use std::os::windows::fs::OpenOptionsExt;
