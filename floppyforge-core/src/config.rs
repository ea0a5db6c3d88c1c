//! Tunable policy for transfer jobs.
use crate::error::TransferError;

/// How many bytes a format (zero-fill) job wipes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatSize {
    /// The full capacity the target device reports.
    DeviceCapacity,
    /// A fixed number of bytes from the start of the device.
    Fixed(u64),
}

#[derive(Clone, Copy, Debug)]
pub struct TransferConfig {
    /// Bytes moved per read/write cycle. Aligned down to the device sector size.
    pub chunk_size: usize,
    /// Short writes tolerated per chunk before the job fails.
    pub max_short_write_retries: u32,
    /// Run the verification pass after write and format jobs.
    pub verify_after_write: bool,
    pub format_size: FormatSize,
    /// Number of snapshots the rate estimate is averaged over.
    pub progress_window: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_short_write_retries: 8,
            verify_after_write: true,
            format_size: FormatSize::DeviceCapacity,
            progress_window: 8,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::invalid("chunk size must be greater than zero"));
        }
        if self.progress_window == 0 {
            return Err(TransferError::invalid("progress window must hold at least one snapshot"));
        }
        if self.format_size == FormatSize::Fixed(0) {
            return Err(TransferError::invalid("format size must be greater than zero"));
        }
        Ok(())
    }
}
