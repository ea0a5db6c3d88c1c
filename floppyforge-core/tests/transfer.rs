use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use floppyforge_core::floppy::{FLOPPY_720K, FLOPPY_1440K};
use floppyforge_core::{
    BlockDevice, ByteSource, CancelToken, ErrorKind, EventSink, JobEvent, JobMode, JobResult,
    JobState, LogLevel, MemoryDevice, NullSink, Phase, Session, TransferConfig, TransferEngine,
    TransferJob,
};
use tempfile::TempDir;

fn no_verify(chunk_size: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        verify_after_write: false,
        ..Default::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8 + 1).collect()
}

fn image_on_disk(data: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::write(&path, data).unwrap();
    (dir, path)
}

#[test]
fn written_bytes_equal_the_sector_rounded_total_for_any_chunk_size() {
    let sizes = [1300usize, 5000, 8192, FLOPPY_720K as usize + 17];
    let chunks = [512usize, 1000, 1536, 4096, 65_536];

    for &size in &sizes {
        let data = pattern(size);
        let (_dir, path) = image_on_disk(&data);
        for &chunk in &chunks {
            let device = MemoryDevice::new("sum", FLOPPY_1440K).with_fill(0xEE);
            let probe = device.clone();
            let source = ByteSource::image_file(&path).unwrap();
            let job = TransferJob::new(source, device, JobMode::Write, &no_verify(chunk));

            let mut engine = TransferEngine::new(job, NullSink);
            assert_eq!(engine.run(), JobResult::Success, "size {size}, chunk {chunk}");

            let writes = probe.writes();
            let accepted: usize = writes.iter().map(|w| w.accepted).sum();
            let rounded = size.div_ceil(512) * 512;
            assert_eq!(accepted, rounded, "size {size}, chunk {chunk}");
            assert!(writes.iter().all(|w| w.offset % 512 == 0 && w.requested % 512 == 0));

            let contents = probe.contents();
            assert_eq!(&contents[..size], &data[..]);
            assert!(contents[size..rounded].iter().all(|&b| b == 0));
            assert!(contents[rounded..].iter().all(|&b| b == 0xEE));
        }
    }
}

#[test]
fn floppy_image_in_64k_chunks_emits_23_progress_events() {
    let data = pattern(FLOPPY_1440K as usize);
    let (_dir, path) = image_on_disk(&data);
    let device = MemoryDevice::new("fd0", FLOPPY_1440K);
    let probe = device.clone();
    let (tx, rx) = unbounded();

    let source = ByteSource::image_file(&path).unwrap();
    let mut engine = TransferEngine::new(
        TransferJob::new(source, device, JobMode::Write, &no_verify(65_536)),
        tx,
    );
    assert_eq!(engine.run(), JobResult::Success);

    let events: Vec<JobEvent> = rx.try_iter().collect();
    assert!(matches!(
        events.first(),
        Some(JobEvent::Started { phase: Phase::Write, total, .. }) if *total == FLOPPY_1440K
    ));
    assert!(matches!(
        events.last(),
        Some(JobEvent::Finished { result: JobResult::Success, .. })
    ));

    let progress: Vec<(u64, u64)> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { done, total, .. } => Some((*done, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 23);
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(progress.last(), Some(&(FLOPPY_1440K, FLOPPY_1440K)));

    let writes = probe.writes();
    assert_eq!(writes.len(), 23);
    assert!(writes[..22].iter().all(|w| w.requested == 65_536));
    assert_eq!(writes[22].requested, 32_768);
    assert_eq!(probe.contents(), data);
}

/// Cancels the job once it has seen `after` progress events.
struct CancelAfter {
    after: usize,
    seen: Mutex<usize>,
    token: CancelToken,
}

impl EventSink for CancelAfter {
    fn emit(&self, event: JobEvent) {
        if let JobEvent::Progress { .. } = event {
            let mut seen = self.seen.lock().unwrap();
            *seen += 1;
            if *seen == self.after {
                self.token.cancel();
            }
        }
    }
}

#[test]
fn cancellation_at_chunk_k_stops_after_exactly_k_chunks() {
    let chunk = 4096;
    for k in [1usize, 3, 7] {
        let device = MemoryDevice::new("cancel", 64 * 1024).with_fill(0xFF);
        let probe = device.clone();
        let job = TransferJob::new(
            ByteSource::zero_fill(64 * 1024),
            device,
            JobMode::ZeroFill,
            &no_verify(chunk),
        );
        let sink = CancelAfter {
            after: k,
            seen: Mutex::new(0),
            token: job.cancel_token(),
        };

        let mut engine = TransferEngine::new(job, sink);
        assert_eq!(engine.run(), JobResult::Cancelled);
        assert_eq!(engine.state(), JobState::Cancelled);
        assert_eq!(engine.bytes_done(), (k * chunk) as u64);
        assert_eq!(probe.writes().len(), k);
        assert_eq!(probe.flush_count(), 1);

        // The device is left as written: no rollback.
        let contents = probe.contents();
        assert!(contents[..k * chunk].iter().all(|&b| b == 0));
        assert!(contents[k * chunk..].iter().all(|&b| b == 0xFF));
    }
}

#[test]
fn oversized_source_fails_before_touching_the_device() {
    let data = pattern(FLOPPY_1440K as usize);
    let (_dir, path) = image_on_disk(&data);
    let device = MemoryDevice::new("dd", FLOPPY_720K).with_fill(0x42);
    let probe = device.clone();
    let before = probe.contents();
    let (tx, rx) = unbounded();

    let source = ByteSource::image_file(&path).unwrap();
    let mut engine = TransferEngine::new(
        TransferJob::new(source, device, JobMode::Write, &TransferConfig::default()),
        tx,
    );
    match engine.run() {
        JobResult::Failed(failure) => {
            assert_eq!(failure.kind, ErrorKind::CapacityMismatch);
            assert_eq!(failure.offset, None);
        }
        other => panic!("expected capacity mismatch, got {other:?}"),
    }

    assert!(probe.writes().is_empty());
    assert_eq!(probe.contents(), before);
    assert!(
        !rx.try_iter()
            .any(|e| matches!(e, JobEvent::Started { .. } | JobEvent::Progress { .. }))
    );
}

#[test]
fn second_job_on_a_busy_device_is_refused_immediately() {
    let session = Session::new(no_verify(512));
    let device = MemoryDevice::new("shared", 128 * 512).with_write_delay(Duration::from_millis(10));

    let first = session
        .start_job(
            ByteSource::zero_fill(128 * 512),
            Box::new(device.clone()),
            JobMode::ZeroFill,
        )
        .unwrap();

    let started = Instant::now();
    let err = session
        .start_job(ByteSource::zero_fill(512), Box::new(device.clone()), JobMode::ZeroFill)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    assert!(started.elapsed() < Duration::from_millis(500));

    session.cancel(first);
    assert_eq!(session.wait(first), Some(JobResult::Cancelled));

    // Once the first job is gone the device is free again.
    let again = session
        .start_job(ByteSource::zero_fill(512), Box::new(device), JobMode::ZeroFill)
        .unwrap();
    assert_eq!(session.wait(again), Some(JobResult::Success));
}

#[test]
fn sessions_share_one_device_registry() {
    let first_session = Session::new(no_verify(512));
    let second_session = Session::new(no_verify(512));
    let device = MemoryDevice::new("two-sessions", 128 * 512).with_write_delay(Duration::from_millis(10));

    let first = first_session
        .start_job(
            ByteSource::zero_fill(128 * 512),
            Box::new(device.clone()),
            JobMode::ZeroFill,
        )
        .unwrap();

    let err = second_session
        .start_job(ByteSource::zero_fill(512), Box::new(device.clone()), JobMode::ZeroFill)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);

    // An engine driven by hand goes through the same registry.
    let job = TransferJob::new(
        ByteSource::zero_fill(512),
        device.clone(),
        JobMode::ZeroFill,
        &no_verify(512),
    );
    let mut engine = TransferEngine::new(job, NullSink);
    match engine.run() {
        JobResult::Failed(failure) => assert_eq!(failure.kind, ErrorKind::DeviceBusy),
        other => panic!("expected busy device, got {other:?}"),
    }

    first_session.cancel(first);
    assert_eq!(first_session.wait(first), Some(JobResult::Cancelled));

    let again = second_session
        .start_job(ByteSource::zero_fill(512), Box::new(device), JobMode::ZeroFill)
        .unwrap();
    assert_eq!(second_session.wait(again), Some(JobResult::Success));
}

#[test]
fn verify_only_job_reports_the_first_difference() {
    let data = pattern(8192);
    let (_dir, path) = image_on_disk(&data);
    let mut device = MemoryDevice::new("cmp", 8192);
    let mut stored = data.clone();
    stored[6000] = !stored[6000];
    device.write_at(0, &stored).unwrap();

    let source = ByteSource::image_file(&path).unwrap();
    let mut engine = TransferEngine::new(
        TransferJob::new(source, device, JobMode::Verify, &no_verify(2048)),
        NullSink,
    );
    match engine.run() {
        JobResult::Failed(failure) => {
            assert_eq!(failure.kind, ErrorKind::VerifyMismatch);
            assert_eq!(failure.offset, Some(6000));
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[cfg(target_os = "linux")]
mod file_targets {
    use super::*;

    fn target_file(len: usize, fill: u8) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.bin");
        std::fs::write(&path, vec![fill; len]).unwrap();
        (dir, path)
    }

    fn finish(session: &Session, job: floppyforge_core::JobId) -> (JobResult, Vec<JobEvent>) {
        let result = session.wait(job).unwrap();
        let events = session.events().try_iter().filter(|e| e.job() == job).collect();
        (result, events)
    }

    #[test]
    fn format_zero_fills_the_full_reported_capacity() {
        let (_dir, target) = target_file(FLOPPY_720K as usize, 0xF6);
        let session = Session::new(TransferConfig::default());

        let job = session.start_format(Path::new(&target)).unwrap();
        let (result, events) = finish(&session, job);
        assert_eq!(result, JobResult::Success);

        let contents = std::fs::read(&target).unwrap();
        assert_eq!(contents.len(), FLOPPY_720K as usize);
        assert!(contents.iter().all(|&b| b == 0));
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Started { phase: Phase::Verify, total, .. } if *total == FLOPPY_720K
        )));
    }

    #[test]
    fn write_then_verify_round_trips() {
        let data = pattern(FLOPPY_1440K as usize);
        let (_img_dir, image) = image_on_disk(&data);
        let (_dir, target) = target_file(FLOPPY_1440K as usize, 0);
        let session = Session::new(TransferConfig::default());

        let job = session.start_write(&image, &target).unwrap();
        let (result, events) = finish(&session, job);
        assert_eq!(result, JobResult::Success);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::LogLine { level: LogLevel::Ok, text, .. } if text.starts_with("verification passed")
        )));
    }

    #[test]
    fn image_larger_than_target_is_a_validation_error() {
        let (_img_dir, image) = image_on_disk(&pattern(FLOPPY_1440K as usize));
        let (_dir, target) = target_file(FLOPPY_720K as usize, 0x11);
        let session = Session::default();

        let err = session.start_write(&image, &target).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityMismatch);
        assert!(std::fs::read(&target).unwrap().iter().all(|&b| b == 0x11));
        assert!(!session.locks().is_held(&target));
    }

    #[test]
    fn missing_device_is_reported_as_not_found() {
        let (_img_dir, image) = image_on_disk(&pattern(4096));
        let session = Session::default();
        let err = session
            .start_write(&image, Path::new("/nonexistent/floppy0"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    }
}
