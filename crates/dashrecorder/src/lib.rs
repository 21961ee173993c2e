//! `dashrecorder` - Loop-recording dashcam core
//!
//! This library records video in fixed-length segments, keeps the footage
//! around a detected impact, evicts old footage by count and by free disk
//! space, and fingerprints every segment so later tampering can be detected.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod capture;
pub mod cli;
pub mod config;
pub mod crash;
pub mod daemon;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod recorder;
pub mod retention;
pub mod segment;
pub mod sensor;
pub mod shutdown;
pub mod store;
pub mod upload;

pub use capture::{CaptureError, FfmpegCapture, VideoCapture};
pub use config::Config;
pub use crash::{CrashDetector, CrashEvent, Detection};
pub use daemon::{Collaborators, Daemon};
pub use error::{Error, Result};
pub use ledger::{IntegrityLedger, LedgerEntry, Verification};
pub use logging::init_logging;
pub use recorder::{CycleOutcome, Recorder, RecorderState};
pub use retention::{RetentionPolicy, RetentionReport, StorageCritical};
pub use segment::{Fingerprint, Segment, SegmentState};
pub use sensor::{Acceleration, AccelerationSensor, IioAccelerometer, SensorError};
pub use shutdown::ShutdownSignal;
pub use store::{SegmentHandle, SegmentStore, StoreOptions, StoreStats};
pub use upload::{CommandUploader, UploadError, UploadScheduler, Uploader};
