//! The raw block transfer engine.
//!
//! A [`TransferEngine`] moves one [`TransferJob`] through
//! `Idle -> Running -> {Completed, Cancelled, Failed}`:
//!
//! 1.  The job is validated. A source that does not fit on the device is
//!     refused here, before a single byte is written.
//! 2.  The source is read in chunks and written at increasing offsets. The
//!     final chunk is zero-padded to a whole sector, so the device never sees
//!     a sub-sector write. Short writes are retried a bounded number of times.
//! 3.  The device is flushed and, if requested, the [`Verifier`] reads the
//!     region back.
//!
//! A running job holds the device's lease in [`DeviceLocks::global`]. An
//! engine started on a job without one takes it itself, and a device that is
//! already leased fails the job with `DeviceBusy`. The lease is released as
//! soon as the job reaches a terminal state.
//!
//! Cancellation is cooperative and checked before every chunk. A cancelled
//! job flushes what it wrote and leaves the device as-is; there is no earlier
//! state to roll back to on physical media.
use std::error::Error as _;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::device::BlockDevice;
use crate::error::{ErrorKind, TransferError};
use crate::lock::{DeviceLease, DeviceLocks};
use crate::progress::{
    EventSink, JobEvent, JobId, LogLevel, Phase, ProgressReporter, ProgressSnapshot,
};
use crate::source::{ByteSource, SourceKind};
use crate::verify::{Verifier, VerifyResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobMode {
    /// Write an image, then verify if configured.
    Write,
    /// Overwrite with zeros, then verify if configured.
    ZeroFill,
    /// Compare the device against an image without writing.
    Verify,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }
}

/// Why a job failed, and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    /// Byte offset of the failure, when one applies. Everything before it
    /// was written; everything after it is untouched.
    pub offset: Option<u64>,
    pub message: String,
}

impl From<&TransferError> for Failure {
    fn from(err: &TransferError) -> Self {
        let mut message = err.to_string();
        let mut cause = err.source();
        while let Some(inner) = cause {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            cause = inner.source();
        }
        Self {
            kind: err.kind(),
            offset: err.offset(),
            message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Cancelled,
    Failed(Failure),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }
}

/// Shared cancellation flag. The interface sets it, the engine polls it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A source bound to a target, with everything fixed at creation time.
pub struct TransferJob {
    id: JobId,
    source: ByteSource,
    target: Box<dyn BlockDevice>,
    mode: JobMode,
    chunk_size: usize,
    total_size: u64,
    verify: bool,
    max_short_write_retries: u32,
    progress_window: usize,
    cancel: CancelToken,
    lease: Option<DeviceLease>,
}

impl TransferJob {
    pub fn new(
        source: ByteSource,
        target: impl BlockDevice + 'static,
        mode: JobMode,
        config: &TransferConfig,
    ) -> Self {
        let sector = target.sector_size().max(1) as usize;
        let chunk_size = (config.chunk_size / sector).max(1) * sector;
        if chunk_size != config.chunk_size {
            debug!(
                requested = config.chunk_size,
                aligned = chunk_size,
                "chunk size aligned to sector size"
            );
        }

        Self {
            id: Uuid::new_v4(),
            total_size: source.size(),
            source,
            target: Box::new(target),
            mode,
            chunk_size,
            verify: mode == JobMode::Verify || config.verify_after_write,
            max_short_write_retries: config.max_short_write_retries,
            progress_window: config.progress_window,
            cancel: CancelToken::new(),
            lease: None,
        }
    }

    /// Hands the job a lease acquired up front, so a refused device is
    /// reported before the job is queued.
    pub(crate) fn attach_lease(&mut self, lease: DeviceLease) {
        self.lease = Some(lease);
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn mode(&self) -> JobMode {
        self.mode
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn source(&self) -> &ByteSource {
        &self.source
    }

    pub fn target(&self) -> &dyn BlockDevice {
        self.target.as_ref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Checks everything that can be checked without touching the device.
    pub fn validate(&self) -> Result<(), TransferError> {
        let zero_source = matches!(self.source.kind(), SourceKind::ZeroFill { .. });
        match self.mode {
            JobMode::ZeroFill if !zero_source => {
                return Err(TransferError::invalid("a zero-fill job needs a zero-fill source"));
            }
            JobMode::Write | JobMode::Verify if zero_source => {
                return Err(TransferError::invalid("write and verify jobs need an image source"));
            }
            _ => {}
        }

        let sector = self.target.sector_size();
        if sector == 0 {
            return Err(TransferError::invalid("device reports a zero sector size"));
        }
        if self.total_size == 0 {
            return Err(TransferError::invalid("nothing to transfer"));
        }

        let required = round_up_u64(self.total_size, u64::from(sector));
        let capacity = self.target.capacity();
        if required > capacity {
            return Err(TransferError::CapacityMismatch { required, capacity });
        }
        Ok(())
    }
}

enum PassOutcome {
    Completed,
    Cancelled,
}

/// Runs one [`TransferJob`] to a terminal state.
pub struct TransferEngine<S: EventSink> {
    job: TransferJob,
    sink: S,
    state: JobState,
    result: Option<JobResult>,
    reporter: ProgressReporter,
    bytes_done: u64,
    last_snapshot: Option<ProgressSnapshot>,
}

impl<S: EventSink> TransferEngine<S> {
    pub fn new(job: TransferJob, sink: S) -> Self {
        let reporter = ProgressReporter::new(job.progress_window);
        Self {
            job,
            sink,
            state: JobState::Idle,
            result: None,
            reporter,
            bytes_done: 0,
            last_snapshot: None,
        }
    }

    pub fn job(&self) -> &TransferJob {
        &self.job
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Bytes of the source written to the device so far.
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn last_snapshot(&self) -> Option<ProgressSnapshot> {
        self.last_snapshot
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.job.cancel_token()
    }

    /// Runs the job. A finished engine returns its recorded result again
    /// without touching the device.
    pub fn run(&mut self) -> JobResult {
        if let Some(result) = &self.result {
            return result.clone();
        }

        self.state = JobState::Running;
        if self.job.lease.is_none() {
            match DeviceLocks::global().try_acquire(self.job.target.path()) {
                Ok(lease) => self.job.lease = Some(lease),
                Err(e) => return self.finish(JobResult::Failed(Failure::from(&e))),
            }
        }
        let result = match self.execute() {
            Ok(PassOutcome::Completed) => JobResult::Success,
            Ok(PassOutcome::Cancelled) => JobResult::Cancelled,
            Err(e) => JobResult::Failed(Failure::from(&e)),
        };
        self.finish(result)
    }

    fn execute(&mut self) -> Result<PassOutcome, TransferError> {
        self.job.validate()?;

        for warning in self.job.source.warnings().to_vec() {
            self.log(LogLevel::Warn, warning);
        }
        let summary = format!(
            "{:?}: {} -> {} ({} bytes per chunk)",
            self.job.mode,
            self.job.source.describe(),
            self.job.target.path().display(),
            self.job.chunk_size
        );
        self.log(LogLevel::Info, summary);

        if self.job.mode != JobMode::Verify {
            if let PassOutcome::Cancelled = self.write_pass()? {
                return Ok(PassOutcome::Cancelled);
            }
        }

        if self.job.verify {
            return self.verify_pass();
        }
        Ok(PassOutcome::Completed)
    }

    fn write_pass(&mut self) -> Result<PassOutcome, TransferError> {
        let total = self.job.total_size;
        let sector = self.job.target.sector_size() as usize;
        let chunk_size = self.job.chunk_size;

        self.sink.emit(JobEvent::Started {
            job: self.job.id,
            phase: Phase::Write,
            total,
        });
        let mut reader = self
            .job
            .source
            .open()
            .map_err(|e| TransferError::SourceIo { offset: 0, source: e })?;
        let mut buffer = vec![0u8; chunk_size];
        let mut meter = Meter::start(total);

        while self.bytes_done < total {
            if self.job.cancel.is_cancelled() {
                let done = self.bytes_done;
                if let Err(e) = self.job.target.flush() {
                    warn!(job = %self.job.id, error = %e, "flush after cancellation failed");
                }
                self.log(
                    LogLevel::Warn,
                    format!("cancelled after {done} bytes; the device is partially written"),
                );
                return Ok(PassOutcome::Cancelled);
            }

            let offset = self.bytes_done;
            let want = std::cmp::min(chunk_size as u64, total - offset) as usize;
            reader.fill(&mut buffer[..want], offset)?;

            let padded = round_up(want, sector);
            buffer[want..padded].fill(0);
            write_chunk(
                self.job.target.as_mut(),
                offset,
                &buffer[..padded],
                self.job.max_short_write_retries,
            )?;

            self.bytes_done += want as u64;
            let snapshot = meter.snapshot(self.bytes_done);
            self.publish(Phase::Write, snapshot);
        }

        self.job.target.flush().map_err(|e| TransferError::Flush {
            offset: self.bytes_done,
            source: e,
        })?;
        self.log(LogLevel::Info, "flush complete".to_string());
        Ok(PassOutcome::Completed)
    }

    fn verify_pass(&mut self) -> Result<PassOutcome, TransferError> {
        let total = self.job.total_size;
        self.sink.emit(JobEvent::Started {
            job: self.job.id,
            phase: Phase::Verify,
            total,
        });
        self.reporter.reset();

        let verifier = Verifier::new(self.job.chunk_size, self.job.cancel.clone());
        let mut meter = Meter::start(total);
        let id = self.job.id;
        let sink = &self.sink;
        let reporter = &mut self.reporter;
        let last_snapshot = &mut self.last_snapshot;
        let result = verifier.verify(&self.job.source, self.job.target.as_mut(), |done| {
            let snapshot = meter.snapshot(done);
            *last_snapshot = Some(snapshot);
            publish(sink, reporter, id, Phase::Verify, snapshot);
        });

        match result {
            VerifyResult::Match { sha256 } => {
                self.log(LogLevel::Ok, format!("verification passed, sha256 {sha256}"));
                Ok(PassOutcome::Completed)
            }
            VerifyResult::Mismatch { offset } => Err(TransferError::VerifyMismatch { offset }),
            VerifyResult::IoError(e) => Err(e),
            VerifyResult::Cancelled => {
                self.log(LogLevel::Warn, "verification cancelled".to_string());
                Ok(PassOutcome::Cancelled)
            }
        }
    }

    fn publish(&mut self, phase: Phase, snapshot: ProgressSnapshot) {
        self.last_snapshot = Some(snapshot);
        publish(&self.sink, &mut self.reporter, self.job.id, phase, snapshot);
    }

    fn finish(&mut self, result: JobResult) -> JobResult {
        let (state, level, text) = match &result {
            JobResult::Success => (JobState::Completed, LogLevel::Ok, "completed".to_string()),
            JobResult::Cancelled => (
                JobState::Cancelled,
                LogLevel::Warn,
                "cancelled by user".to_string(),
            ),
            JobResult::Failed(failure) => {
                (JobState::Failed, LogLevel::Error, failure.message.clone())
            }
        };
        debug_assert!(!self.state.is_terminal());
        self.state = state;
        self.job.lease = None;
        self.log(level, text);
        self.result = Some(result.clone());
        self.sink.emit(JobEvent::Finished {
            job: self.job.id,
            result: result.clone(),
        });
        result
    }

    fn log(&self, level: LogLevel, text: String) {
        let job = self.job.id;
        match level {
            LogLevel::Info | LogLevel::Ok => info!(%job, "{text}"),
            LogLevel::Warn => warn!(%job, "{text}"),
            LogLevel::Error => error!(%job, "{text}"),
        }
        self.sink.emit(JobEvent::LogLine { job, level, text });
    }
}

fn publish<S: EventSink>(
    sink: &S,
    reporter: &mut ProgressReporter,
    job: JobId,
    phase: Phase,
    snapshot: ProgressSnapshot,
) {
    let figures = reporter.observe(snapshot);
    sink.emit(JobEvent::Progress {
        job,
        phase,
        done: snapshot.bytes_done,
        total: snapshot.bytes_total,
        rate_bps: figures.rate_bps,
        eta_seconds: figures.eta_seconds,
        percent: figures.percent,
    });
}

/// Elapsed time and per-chunk rate for one pass.
struct Meter {
    total: u64,
    started: Instant,
    last_at: Duration,
    last_bytes: u64,
}

impl Meter {
    fn start(total: u64) -> Self {
        Self {
            total,
            started: Instant::now(),
            last_at: Duration::ZERO,
            last_bytes: 0,
        }
    }

    fn snapshot(&mut self, done: u64) -> ProgressSnapshot {
        let elapsed = self.started.elapsed();
        let dt = (elapsed - self.last_at).as_secs_f64();
        let instantaneous_rate_bps = if dt > 0.0 {
            (done - self.last_bytes) as f64 / dt
        } else {
            0.0
        };
        self.last_at = elapsed;
        self.last_bytes = done;
        ProgressSnapshot {
            bytes_done: done,
            bytes_total: self.total,
            elapsed,
            instantaneous_rate_bps,
        }
    }
}

/// Writes all of `data` at `offset`, looping over short writes.
///
/// Each short write costs one retry; once `max_retries` are spent the chunk
/// fails with the offset of the first byte that never made it to the device.
fn write_chunk(
    target: &mut dyn BlockDevice,
    offset: u64,
    data: &[u8],
    max_retries: u32,
) -> Result<(), TransferError> {
    let mut written = 0;
    let mut retries = 0;
    while written < data.len() {
        let at = offset + written as u64;
        match target.write_at(at, &data[written..]) {
            Ok(n) => {
                written += n;
                if written < data.len() {
                    retries += 1;
                    if retries > max_retries {
                        return Err(TransferError::Write {
                            offset: offset + written as u64,
                            source: io::Error::new(
                                io::ErrorKind::WriteZero,
                                format!("device kept accepting partial writes after {max_retries} retries"),
                            ),
                        });
                    }
                    debug!(offset = at, accepted = n, retries, "short write, retrying remainder");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Write { offset: at, source: e }),
        }
    }
    Ok(())
}

pub(crate) fn round_up(len: usize, align: usize) -> usize {
    len.div_ceil(align) * align
}

fn round_up_u64(len: u64, align: u64) -> u64 {
    len.div_ceil(align) * align
}
