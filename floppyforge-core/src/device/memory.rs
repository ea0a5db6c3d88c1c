use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{BlockDevice, DEFAULT_SECTOR_SIZE};

/// One `write_at` call as seen by a [`MemoryDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub offset: u64,
    pub requested: usize,
    pub accepted: usize,
}

#[derive(Default)]
struct Faults {
    max_write: Option<usize>,
    fail_write_at: Option<u64>,
    corrupt_at: Option<u64>,
    write_delay: Option<Duration>,
}

struct State {
    data: Vec<u8>,
    faults: Faults,
    writes: Vec<WriteRecord>,
    flushes: usize,
}

/// A block device backed by memory, for tests and dry runs.
///
/// Clones share the same storage, so a caller can keep a handle to inspect
/// the device after a job has taken ownership of it.
#[derive(Clone)]
pub struct MemoryDevice {
    path: PathBuf,
    sector_size: u32,
    state: Arc<Mutex<State>>,
}

impl MemoryDevice {
    pub fn new(name: &str, capacity: u64) -> Self {
        Self {
            path: PathBuf::from(format!("mem:{name}")),
            sector_size: DEFAULT_SECTOR_SIZE,
            state: Arc::new(Mutex::new(State {
                data: vec![0; capacity as usize],
                faults: Faults::default(),
                writes: Vec::new(),
                flushes: 0,
            })),
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Sets every byte of the device to `byte`.
    pub fn with_fill(self, byte: u8) -> Self {
        self.state().data.fill(byte);
        self
    }

    /// Accepts at most `limit` bytes per `write_at` call.
    pub fn with_max_write(self, limit: usize) -> Self {
        self.state().faults.max_write = Some(limit);
        self
    }

    /// Fails any write that covers `offset`.
    pub fn with_write_failure_at(self, offset: u64) -> Self {
        self.state().faults.fail_write_at = Some(offset);
        self
    }

    /// Silently stores a flipped byte at `offset`.
    pub fn with_corruption_at(self, offset: u64) -> Self {
        self.state().faults.corrupt_at = Some(offset);
        self
    }

    /// Sleeps for `delay` on every write.
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.state().faults.write_delay = Some(delay);
        self
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state().flushes
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlockDevice for MemoryDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn capacity(&self) -> u64 {
        self.state().data.len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let delay = self.state().faults.write_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        let end = offset + buf.len() as u64;
        if end > state.data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write of {} bytes at {offset} runs past the end of the device", buf.len()),
            ));
        }
        if let Some(bad) = state.faults.fail_write_at {
            if (offset..end).contains(&bad) {
                return Err(io::Error::other(format!("simulated media error at {bad}")));
            }
        }

        let accepted = state.faults.max_write.map_or(buf.len(), |m| m.min(buf.len()));
        let start = offset as usize;
        state.data[start..start + accepted].copy_from_slice(&buf[..accepted]);
        if let Some(bad) = state.faults.corrupt_at {
            if (offset..offset + accepted as u64).contains(&bad) {
                state.data[bad as usize] ^= 0xFF;
            }
        }
        state.writes.push(WriteRecord {
            offset,
            requested: buf.len(),
            accepted,
        });
        Ok(accepted)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.state();
        let len = state.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len() as u64, len - offset) as usize;
        let start = offset as usize;
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state().flushes += 1;
        Ok(())
    }
}
