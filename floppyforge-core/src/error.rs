//! Error types for the transfer engine.
//!
//! [`TransferError`] carries the full failure detail, including the underlying
//! I/O error where there is one. [`ErrorKind`] is the cheap, copyable
//! projection that ends up in a [`crate::JobResult`] and on the event channel.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating, running or verifying a transfer job.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Another job already holds the device, or the OS reports it in use.
    #[error("device {} is busy", path.display())]
    DeviceBusy { path: PathBuf },

    #[error("permission denied opening {}; elevated privileges may be required", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("device {} not found or not ready; insert a disk and retry", path.display())]
    DeviceNotFound { path: PathBuf },

    #[error("failed to open {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The (sector-rounded) source does not fit on the target.
    #[error("source needs {required} bytes but the device holds only {capacity}")]
    CapacityMismatch { required: u64, capacity: u64 },

    /// The source reported end of stream before delivering its declared size.
    #[error("source ended at offset {offset}, {expected} bytes were expected")]
    ShortSource { offset: u64, expected: u64 },

    #[error("reading the source failed at offset {offset}")]
    SourceIo {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("write failed at offset {offset}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("device read failed at offset {offset}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("flushing the device failed after {offset} bytes")]
    Flush {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("device content differs from the source at offset {offset}")]
    VerifyMismatch { offset: u64 },

    /// Rejected before start: empty image, bad ADF geometry, bad configuration.
    #[error("invalid job: {reason}")]
    InvalidJob { reason: String },
}

/// Copyable classification of a [`TransferError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceBusy,
    PermissionDenied,
    DeviceNotFound,
    CapacityMismatch,
    ShortSource,
    SourceIo,
    WriteError,
    ReadError,
    FlushError,
    VerifyMismatch,
    InvalidJob,
}

/// Broad failure classes, used to decide how a failure is presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected before any destructive action; the job never started.
    Validation,
    /// The device misbehaved or went away.
    Device,
    /// The image itself is suspect.
    Source,
    /// Data was written but does not read back identically.
    Verification,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::CapacityMismatch | ErrorKind::InvalidJob => ErrorCategory::Validation,
            ErrorKind::DeviceBusy
            | ErrorKind::PermissionDenied
            | ErrorKind::DeviceNotFound
            | ErrorKind::WriteError
            | ErrorKind::ReadError
            | ErrorKind::FlushError => ErrorCategory::Device,
            ErrorKind::ShortSource | ErrorKind::SourceIo => ErrorCategory::Source,
            ErrorKind::VerifyMismatch => ErrorCategory::Verification,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DeviceBusy => "device busy",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::CapacityMismatch => "capacity mismatch",
            ErrorKind::ShortSource => "short source",
            ErrorKind::SourceIo => "source I/O error",
            ErrorKind::WriteError => "write error",
            ErrorKind::ReadError => "read error",
            ErrorKind::FlushError => "flush error",
            ErrorKind::VerifyMismatch => "verification mismatch",
            ErrorKind::InvalidJob => "invalid job",
        };
        f.write_str(name)
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            TransferError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            TransferError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            // An open failure that is none of the above still means the device is unusable.
            TransferError::Open { .. } => ErrorKind::DeviceNotFound,
            TransferError::CapacityMismatch { .. } => ErrorKind::CapacityMismatch,
            TransferError::ShortSource { .. } => ErrorKind::ShortSource,
            TransferError::SourceIo { .. } => ErrorKind::SourceIo,
            TransferError::Write { .. } => ErrorKind::WriteError,
            TransferError::Read { .. } => ErrorKind::ReadError,
            TransferError::Flush { .. } => ErrorKind::FlushError,
            TransferError::VerifyMismatch { .. } => ErrorKind::VerifyMismatch,
            TransferError::InvalidJob { .. } => ErrorKind::InvalidJob,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// The byte offset at which the failure occurred, when one is meaningful.
    pub fn offset(&self) -> Option<u64> {
        match self {
            TransferError::ShortSource { offset, .. }
            | TransferError::SourceIo { offset, .. }
            | TransferError::Write { offset, .. }
            | TransferError::Read { offset, .. }
            | TransferError::Flush { offset, .. }
            | TransferError::VerifyMismatch { offset } => Some(*offset),
            _ => None,
        }
    }

    /// Maps an error from opening a device path onto the device error variants.
    pub fn from_open(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::PermissionDenied => TransferError::PermissionDenied { path },
            io::ErrorKind::NotFound => TransferError::DeviceNotFound { path },
            io::ErrorKind::ResourceBusy => TransferError::DeviceBusy { path },
            _ if is_ebusy(&err) => TransferError::DeviceBusy { path },
            _ => TransferError::Open { path, source: err },
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        TransferError::InvalidJob {
            reason: reason.into(),
        }
    }
}

#[cfg(unix)]
fn is_ebusy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBUSY)
}

#[cfg(windows)]
fn is_ebusy(err: &io::Error) -> bool {
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, ERROR_SHARING_VIOLATION};
    err.raw_os_error()
        .is_some_and(|code| code as u32 == ERROR_SHARING_VIOLATION || code as u32 == ERROR_LOCK_VIOLATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_errors_map_to_device_kinds() {
        let denied = TransferError::from_open(
            "/dev/fd0",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let missing = TransferError::from_open("/dev/fd9", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(missing.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(missing.category(), ErrorCategory::Device);
    }

    #[cfg(unix)]
    #[test]
    fn ebusy_is_device_busy() {
        let err = TransferError::from_open("/dev/fd0", io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    }

    #[test]
    fn offsets_are_preserved() {
        let err = TransferError::Write {
            offset: 4096,
            source: io::Error::from(io::ErrorKind::WriteZero),
        };
        assert_eq!(err.offset(), Some(4096));
        assert_eq!(err.kind(), ErrorKind::WriteError);

        let err = TransferError::CapacityMismatch {
            required: 2,
            capacity: 1,
        };
        assert_eq!(err.offset(), None);
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
}
