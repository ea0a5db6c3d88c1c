//! Progress accounting and the events sent to the consuming interface.
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::engine::JobResult;

pub type JobId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Write,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Write => "write",
            Phase::Verify => "verify",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Ok,
    Warn,
    Error,
}

/// Counters at one chunk boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub elapsed: Duration,
    /// Rate across the last chunk alone.
    pub instantaneous_rate_bps: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Started {
        job: JobId,
        phase: Phase,
        total: u64,
    },
    Progress {
        job: JobId,
        phase: Phase,
        done: u64,
        total: u64,
        rate_bps: f64,
        eta_seconds: Option<f64>,
        percent: f64,
    },
    LogLine {
        job: JobId,
        level: LogLevel,
        text: String,
    },
    Finished {
        job: JobId,
        result: JobResult,
    },
}

impl JobEvent {
    pub fn job(&self) -> JobId {
        match self {
            JobEvent::Started { job, .. }
            | JobEvent::Progress { job, .. }
            | JobEvent::LogLine { job, .. }
            | JobEvent::Finished { job, .. } => *job,
        }
    }
}

/// Receives job events. Implementations must not block for long; they are
/// called on the worker thread between chunks.
pub trait EventSink: Send {
    fn emit(&self, event: JobEvent);
}

impl EventSink for Sender<JobEvent> {
    fn emit(&self, event: JobEvent) {
        // A consumer that went away is not the job's problem.
        let _ = self.send(event);
    }
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: JobEvent) {}
}

/// Turns snapshots into rate, ETA and percentage figures.
///
/// The rate is averaged over a sliding window of the most recent snapshots
/// to smooth the jitter of individual chunks.
pub struct ProgressReporter {
    window: VecDeque<ProgressSnapshot>,
    capacity: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressFigures {
    pub rate_bps: f64,
    pub eta_seconds: Option<f64>,
    pub percent: f64,
}

impl ProgressReporter {
    pub fn new(window: usize) -> Self {
        let capacity = window.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn observe(&mut self, snapshot: ProgressSnapshot) -> ProgressFigures {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(snapshot);

        let rate_bps = self.windowed_rate();
        let remaining = snapshot.bytes_total.saturating_sub(snapshot.bytes_done);
        let eta_seconds = if rate_bps > 0.0 {
            Some(remaining as f64 / rate_bps)
        } else {
            None
        };
        ProgressFigures {
            rate_bps,
            eta_seconds,
            percent: percent_of(snapshot.bytes_done, snapshot.bytes_total),
        }
    }

    fn windowed_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.window.front(), self.window.back()) else {
            return 0.0;
        };
        // With a single snapshot the window starts at the beginning of the job.
        let (bytes, secs) = if self.window.len() == 1 {
            (last.bytes_done, last.elapsed.as_secs_f64())
        } else {
            (
                last.bytes_done - first.bytes_done,
                (last.elapsed - first.elapsed).as_secs_f64(),
            )
        };
        if secs <= 0.0 { 0.0 } else { bytes as f64 / secs }
    }
}

pub fn percent_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(done: u64, millis: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_done: done,
            bytes_total: 1000,
            elapsed: Duration::from_millis(millis),
            instantaneous_rate_bps: 0.0,
        }
    }

    #[test]
    fn rate_uses_the_window_not_the_whole_job() {
        let mut reporter = ProgressReporter::new(2);
        reporter.observe(snap(100, 1000));
        reporter.observe(snap(200, 2000));
        // Window is now [200@2s, 600@3s]: 400 bytes over 1 s.
        let figures = reporter.observe(snap(600, 3000));
        assert!((figures.rate_bps - 400.0).abs() < 1e-9);
        assert!((figures.eta_seconds.unwrap() - 1.0).abs() < 1e-9);
        assert!((figures.percent - 60.0).abs() < 1e-9);
    }

    #[test]
    fn first_snapshot_measures_from_job_start() {
        let mut reporter = ProgressReporter::new(8);
        let figures = reporter.observe(snap(500, 500));
        assert!((figures.rate_bps - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_time_gives_unknown_eta() {
        let mut reporter = ProgressReporter::new(8);
        let figures = reporter.observe(snap(10, 0));
        assert_eq!(figures.rate_bps, 0.0);
        assert_eq!(figures.eta_seconds, None);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_of(5, 0), 0.0);
        assert_eq!(percent_of(2000, 1000), 100.0);
    }
}
