//! The core, UI-agnostic library for the `floppyforge` floppy imaging utility.
//!
//! `floppyforge-core` writes raw disk images to removable media and zero-fills
//! them, with progress reporting, cooperative cancellation and read-back
//! verification. Any front end can drive it: the `floppyforge` CLI, a GUI, or
//! a test harness.
//!
//! The library is structured into several key modules:
//! - [`source`]: byte sources: raw images, Amiga ADF images, zero fill.
//! - [`device`]: the [`BlockDevice`] trait with raw and in-memory targets.
//! - [`engine`]: the chunked, sector-aligned [`TransferEngine`].
//! - [`verify`]: the fail-fast [`Verifier`].
//! - [`progress`]: snapshots, rate/ETA smoothing and [`JobEvent`]s.
//! - [`lock`]: exclusive per-device leases.
//! - [`session`]: the command surface that runs jobs on worker threads.
//! - [`platform`]: drive discovery, geometry ioctls and unmounting.
//!
//! ## Example: Zero-filling a device and watching progress
//!
//! ```rust,no_run
//! use floppyforge_core::{JobEvent, JobResult, Session, TransferConfig};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let session = Session::new(TransferConfig::default());
//!     let events = session.events();
//!     let job = session.start_format(Path::new("/dev/fd0"))?;
//!
//!     for event in events.iter() {
//!         match event {
//!             JobEvent::Progress { done, total, .. } => println!("{done}/{total} bytes"),
//!             JobEvent::Finished { result, .. } => {
//!                 assert_eq!(result, JobResult::Success);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     session.wait(job);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod floppy;
pub mod lock;
mod os_options;
pub mod platform;
pub mod progress;
pub mod session;
pub mod source;
pub mod verify;

pub use config::{FormatSize, TransferConfig};
pub use device::{BlockDevice, Device, MemoryDevice, RawDevice};
pub use engine::{CancelToken, Failure, JobMode, JobResult, JobState, TransferEngine, TransferJob};
pub use error::{ErrorCategory, ErrorKind, TransferError};
pub use floppy::FloppyFormat;
pub use progress::{EventSink, JobEvent, JobId, LogLevel, NullSink, Phase, ProgressSnapshot};
pub use session::Session;
pub use source::ByteSource;
pub use verify::{VerifyResult, Verifier};
