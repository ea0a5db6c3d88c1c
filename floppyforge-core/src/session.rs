//! The command surface used by front ends.
//!
//! A [`Session`] starts jobs on background threads, one thread per job, and
//! funnels every job's events into a single channel. Each job holds an
//! exclusive lease on its device for as long as it runs, so a second job
//! against the same device is refused up front with `DeviceBusy`. Leases come
//! from the process-wide registry, so this holds across sessions too.
//!
//! ```rust,no_run
//! use floppyforge_core::{JobEvent, Session, TransferConfig};
//! use std::path::Path;
//!
//! let session = Session::new(TransferConfig::default());
//! let job = session.start_write(Path::new("dos622.img"), Path::new("/dev/fd0"))?;
//! for event in session.events().iter() {
//!     if let JobEvent::Finished { result, .. } = event {
//!         println!("{job}: {result:?}");
//!         break;
//!     }
//! }
//! # Ok::<(), floppyforge_core::TransferError>(())
//! ```
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{info, warn};

use crate::config::{FormatSize, TransferConfig};
use crate::device::{Access, BlockDevice, RawDevice};
use crate::engine::{CancelToken, Failure, JobMode, JobResult, TransferEngine, TransferJob};
use crate::error::TransferError;
use crate::lock::DeviceLocks;
use crate::platform;
use crate::progress::{JobEvent, JobId};
use crate::source::ByteSource;

enum JobSlot {
    Running {
        cancel: CancelToken,
        handle: JoinHandle<JobResult>,
    },
    /// The worker has exited; its result is kept until someone waits for it.
    Done(JobResult),
}

pub struct Session {
    config: TransferConfig,
    locks: &'static DeviceLocks,
    events_tx: Sender<JobEvent>,
    events_rx: Receiver<JobEvent>,
    jobs: Mutex<HashMap<JobId, JobSlot>>,
}

impl Session {
    pub fn new(config: TransferConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            locks: DeviceLocks::global(),
            events_tx,
            events_rx,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn locks(&self) -> &DeviceLocks {
        self.locks
    }

    /// Events from every job started by this session.
    pub fn events(&self) -> Receiver<JobEvent> {
        self.events_rx.clone()
    }

    /// Writes an image file (raw, ADF or compressed) to a device.
    pub fn start_write(&self, image_path: &Path, device_path: &Path) -> Result<JobId, TransferError> {
        let source = ByteSource::from_image_path(image_path)?;
        self.start_write_source(source, device_path)
    }

    /// Writes an already prepared image source to a device.
    pub fn start_write_source(
        &self,
        source: ByteSource,
        device_path: &Path,
    ) -> Result<JobId, TransferError> {
        self.start_on_path(source, device_path, JobMode::Write)
    }

    /// Zero-fills a device. The size follows [`TransferConfig::format_size`].
    pub fn start_format(&self, device_path: &Path) -> Result<JobId, TransferError> {
        self.config.validate()?;
        let lease = self.locks.try_acquire(device_path)?;
        platform::unmount_best_effort(device_path);
        let device = RawDevice::open(device_path, Access::ReadWrite)?;
        let size = match self.config.format_size {
            FormatSize::DeviceCapacity => device.capacity(),
            FormatSize::Fixed(size) => size,
        };
        self.spawn(ByteSource::zero_fill(size), Box::new(device), JobMode::ZeroFill, lease)
    }

    /// Compares a device against an image without writing.
    pub fn start_verify(&self, image_path: &Path, device_path: &Path) -> Result<JobId, TransferError> {
        let source = ByteSource::from_image_path(image_path)?;
        self.start_on_path(source, device_path, JobMode::Verify)
    }

    /// Starts a job against an already opened device.
    pub fn start_job(
        &self,
        source: ByteSource,
        target: Box<dyn BlockDevice>,
        mode: JobMode,
    ) -> Result<JobId, TransferError> {
        self.config.validate()?;
        let lease = self.locks.try_acquire(target.path())?;
        self.spawn(source, target, mode, lease)
    }

    /// Requests cancellation. Returns `false` for unknown or finished jobs.
    pub fn cancel(&self, job: JobId) -> bool {
        match self.jobs().get(&job) {
            Some(JobSlot::Running { cancel, handle }) if !handle.is_finished() => {
                info!(%job, "cancellation requested");
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Blocks until the job ends and returns its result. `None` if the job is
    /// unknown or was already waited for.
    pub fn wait(&self, job: JobId) -> Option<JobResult> {
        let slot = self.jobs().remove(&job)?;
        match slot {
            JobSlot::Running { handle, .. } => Some(join_worker(job, handle)),
            JobSlot::Done(result) => Some(result),
        }
    }

    /// Joins workers that have already exited, keeping only their results.
    fn reap_finished(&self) {
        let mut jobs = self.jobs();
        let finished: Vec<JobId> = jobs
            .iter()
            .filter(|(_, slot)| matches!(slot, JobSlot::Running { handle, .. } if handle.is_finished()))
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(JobSlot::Running { handle, .. }) = jobs.remove(&id) {
                jobs.insert(id, JobSlot::Done(join_worker(id, handle)));
            }
        }
    }

    fn start_on_path(
        &self,
        source: ByteSource,
        device_path: &Path,
        mode: JobMode,
    ) -> Result<JobId, TransferError> {
        self.config.validate()?;
        let lease = self.locks.try_acquire(device_path)?;
        let access = if mode == JobMode::Verify {
            Access::ReadOnly
        } else {
            platform::unmount_best_effort(device_path);
            Access::ReadWrite
        };
        let device = RawDevice::open(device_path, access)?;
        self.spawn(source, Box::new(device), mode, lease)
    }

    fn spawn(
        &self,
        source: ByteSource,
        target: Box<dyn BlockDevice>,
        mode: JobMode,
        lease: crate::lock::DeviceLease,
    ) -> Result<JobId, TransferError> {
        let mut job = TransferJob::new(source, target, mode, &self.config);
        // Refuse before the thread exists so nothing destructive can start.
        job.validate()?;
        job.attach_lease(lease);
        self.reap_finished();

        let id = job.id();
        let cancel = job.cancel_token();
        let sink = self.events_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("floppyforge-{id}"))
            .spawn(move || TransferEngine::new(job, sink).run())
            .map_err(|e| TransferError::invalid(format!("could not start worker thread: {e}")))?;

        info!(job = %id, ?mode, "job started");
        self.jobs().insert(id, JobSlot::Running { cancel, handle });
        Ok(id)
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobSlot>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn join_worker(job: JobId, handle: JoinHandle<JobResult>) -> JobResult {
    handle.join().unwrap_or_else(|_| {
        warn!(%job, "job thread panicked");
        JobResult::Failed(Failure {
            kind: crate::ErrorKind::InvalidJob,
            offset: None,
            message: "job thread panicked".to_string(),
        })
    })
}

impl Default for Session {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}
