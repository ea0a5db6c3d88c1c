//! Post-write verification.
//!
//! The verifier re-opens the source from its first byte and reads the device
//! back in the same chunk size the engine wrote with. It stops at the first
//! differing byte: one mismatch already means the write cannot be trusted.
use std::io;

use sha2::{Digest, Sha256};

use crate::device::BlockDevice;
use crate::engine::{CancelToken, round_up};
use crate::error::TransferError;
use crate::source::ByteSource;

#[derive(Debug)]
pub enum VerifyResult {
    /// Every byte matched. Carries the SHA-256 of the verified region.
    Match { sha256: String },
    /// First offset at which the device differs from the source.
    Mismatch { offset: u64 },
    IoError(TransferError),
    Cancelled,
}

pub struct Verifier {
    chunk_size: usize,
    cancel: CancelToken,
}

impl Verifier {
    pub fn new(chunk_size: usize, cancel: CancelToken) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            cancel,
        }
    }

    /// Compares the first `source.size()` bytes of `target` with `source`.
    ///
    /// `on_progress` receives the number of bytes verified so far after each
    /// chunk.
    pub fn verify<F>(
        &self,
        source: &ByteSource,
        target: &mut dyn BlockDevice,
        mut on_progress: F,
    ) -> VerifyResult
    where
        F: FnMut(u64),
    {
        let mut reader = match source.open() {
            Ok(reader) => reader,
            Err(e) => {
                return VerifyResult::IoError(TransferError::SourceIo {
                    offset: 0,
                    source: e,
                });
            }
        };

        let sector = target.sector_size().max(1) as usize;
        let total = source.size();
        let mut source_buf = vec![0u8; self.chunk_size];
        let mut device_buf = vec![0u8; round_up(self.chunk_size, sector)];
        let mut hasher = Sha256::new();

        let mut offset: u64 = 0;
        while offset < total {
            if self.cancel.is_cancelled() {
                return VerifyResult::Cancelled;
            }

            let want = std::cmp::min(self.chunk_size as u64, total - offset) as usize;
            if let Err(e) = reader.fill(&mut source_buf[..want], offset) {
                return VerifyResult::IoError(e);
            }

            let padded = round_up(want, sector);
            if let Err(e) = read_exact_at(target, offset, &mut device_buf[..padded]) {
                return VerifyResult::IoError(e);
            }

            if let Some(i) = source_buf[..want]
                .iter()
                .zip(&device_buf[..want])
                .position(|(a, b)| a != b)
            {
                return VerifyResult::Mismatch {
                    offset: offset + i as u64,
                };
            }

            hasher.update(&device_buf[..want]);
            offset += want as u64;
            on_progress(offset);
        }

        VerifyResult::Match {
            sha256: format!("{:x}", hasher.finalize()),
        }
    }
}

fn read_exact_at(
    target: &mut dyn BlockDevice,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let at = offset + filled as u64;
        match target.read_at(at, &mut buf[filled..]) {
            Ok(0) => {
                return Err(TransferError::Read {
                    offset: at,
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device ended before the verified region",
                    ),
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Read { offset: at, source: e }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn image(len: usize) -> (tempfile::TempDir, ByteSource, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let source = ByteSource::image_file(&path).unwrap();
        (dir, source, data)
    }

    #[test]
    fn identical_content_matches() {
        let (_dir, source, data) = image(5000);
        let mut device = MemoryDevice::new("v", 8192);
        device.write_at(0, &data).unwrap();

        let mut progress = Vec::new();
        let result = Verifier::new(2048, CancelToken::new()).verify(&source, &mut device, |d| {
            progress.push(d)
        });
        assert!(matches!(result, VerifyResult::Match { .. }));
        assert_eq!(progress, vec![2048, 4096, 5000]);
    }

    #[test]
    fn reports_first_mismatch_only() {
        let (_dir, source, mut data) = image(5000);
        data[3001] ^= 1;
        data[4500] ^= 1;
        let mut device = MemoryDevice::new("v", 8192);
        device.write_at(0, &data).unwrap();

        let result = Verifier::new(1024, CancelToken::new()).verify(&source, &mut device, |_| {});
        assert!(matches!(result, VerifyResult::Mismatch { offset: 3001 }));
    }

    #[test]
    fn honours_cancellation() {
        let (_dir, source, _) = image(4096);
        let mut device = MemoryDevice::new("v", 4096);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = Verifier::new(1024, cancel).verify(&source, &mut device, |_| {});
        assert!(matches!(result, VerifyResult::Cancelled));
    }
}
