//! The recorder producer loop.
//!
//! One cycle allocates a segment, captures into it, completes it,
//! fingerprints it and enforces retention:
//!
//! ```text
//! Idle -> Capturing -> Finalizing -> Idle
//! ```
//!
//! A failed or empty capture discards the slot and the loop starts a fresh
//! cycle. Fingerprinting failures are logged and never stop recording.
//!
//! A crash detected while a segment is between completion and its ledger
//! entry still preserves it (preservation only needs the segment to be
//! normal). A crash detected while the only candidate is still capturing
//! finds the previous segment, or nothing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capture::VideoCapture;
use crate::ledger::{IntegrityLedger, LedgerEntry};
use crate::retention::{RetentionPolicy, RetentionReport};
use crate::segment::Segment;
use crate::shutdown::ShutdownSignal;
use crate::store::SegmentStore;

/// Where the recorder is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Between cycles.
    Idle,
    /// Waiting for the capture collaborator.
    Capturing,
    /// Completing, fingerprinting and enforcing retention.
    Finalizing,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Capturing => write!(f, "capturing"),
            Self::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Result of one recorder cycle.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// A segment was recorded.
    Recorded {
        /// The completed segment.
        segment: Segment,
        /// Its ledger entry; `None` if fingerprinting failed.
        entry: Option<LedgerEntry>,
        /// What retention did afterwards.
        retention: RetentionReport,
    },
    /// The capture failed or produced nothing; the slot was discarded.
    Discarded {
        /// Why the cycle was discarded.
        reason: String,
    },
    /// Shutdown fired during the capture; the slot was discarded.
    Cancelled,
}

/// Shortest pause after a discarded cycle, so a camera that fails
/// instantly does not burn through segment names.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The producer loop.
pub struct Recorder {
    store: Arc<SegmentStore>,
    ledger: Arc<IntegrityLedger>,
    retention: Arc<RetentionPolicy>,
    capture: Arc<dyn VideoCapture>,
    segment_duration: Duration,
    retry_delay: Duration,
    state: Mutex<RecorderState>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("capture", &self.capture.name())
            .field("segment_duration", &self.segment_duration)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Create a recorder producing segments of `segment_duration`.
    #[must_use]
    pub fn new(
        store: Arc<SegmentStore>,
        ledger: Arc<IntegrityLedger>,
        retention: Arc<RetentionPolicy>,
        capture: Arc<dyn VideoCapture>,
        segment_duration: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            retention,
            capture,
            segment_duration,
            retry_delay: Duration::ZERO,
            state: Mutex::new(RecorderState::Idle),
        }
    }

    /// Pause for `delay` after a discarded cycle, never less than
    /// [`MIN_RETRY_DELAY`].
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RecorderState {
        *self.state.lock()
    }

    fn set_state(&self, state: RecorderState) {
        *self.state.lock() = state;
    }

    /// Run one capture cycle.
    pub async fn run_cycle(&self, shutdown: &ShutdownSignal) -> CycleOutcome {
        let outcome = self.cycle(shutdown).await;
        self.set_state(RecorderState::Idle);
        outcome
    }

    async fn cycle(&self, shutdown: &ShutdownSignal) -> CycleOutcome {
        let handle = match self.store.begin_segment() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Failed to allocate segment");
                return CycleOutcome::Discarded {
                    reason: e.to_string(),
                };
            }
        };

        self.set_state(RecorderState::Capturing);
        debug!(segment = %handle.name(), capture = self.capture.name(), "Capturing");
        let captured = tokio::select! {
            () = shutdown.triggered() => None,
            result = self.capture.capture(handle.path(), self.segment_duration) => Some(result),
        };
        self.set_state(RecorderState::Finalizing);

        let bytes_written = match captured {
            None => {
                debug!(segment = %handle.name(), "Capture cancelled by shutdown");
                if let Err(e) = self.store.discard_segment(handle) {
                    warn!(error = %e, "Failed to discard cancelled segment");
                }
                return CycleOutcome::Cancelled;
            }
            Some(Err(e)) => {
                warn!(segment = %handle.name(), error = %e, "Capture failed, segment discarded");
                if let Err(discard_err) = self.store.discard_segment(handle) {
                    warn!(error = %discard_err, "Failed to discard segment");
                }
                return CycleOutcome::Discarded {
                    reason: e.to_string(),
                };
            }
            Some(Ok(bytes)) => bytes,
        };

        let segment = match self.store.complete_segment(handle, bytes_written) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(error = %e, "Segment discarded");
                return CycleOutcome::Discarded {
                    reason: e.to_string(),
                };
            }
        };

        let entry = self.fingerprint(&segment).await;
        let retention = self.enforce_retention().await;

        CycleOutcome::Recorded {
            segment,
            entry,
            retention,
        }
    }

    async fn fingerprint(&self, segment: &Segment) -> Option<LedgerEntry> {
        let ledger = Arc::clone(&self.ledger);
        let target = segment.clone();
        match tokio::task::spawn_blocking(move || ledger.fingerprint_and_record(&target)).await {
            Ok(Ok(entry)) => Some(entry),
            Ok(Err(e)) => {
                warn!(segment = %segment.name, error = %e, "Failed to fingerprint segment");
                None
            }
            Err(e) => {
                warn!(segment = %segment.name, error = %e, "Fingerprint task failed");
                None
            }
        }
    }

    async fn enforce_retention(&self) -> RetentionReport {
        let retention = Arc::clone(&self.retention);
        match tokio::task::spawn_blocking(move || retention.enforce()).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Retention task failed");
                RetentionReport::default()
            }
        }
    }

    /// Record segments until shutdown.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        info!(
            segment_secs = self.segment_duration.as_secs(),
            capture = self.capture.name(),
            "Recorder started"
        );

        while !shutdown.is_triggered() {
            match self.run_cycle(&shutdown).await {
                CycleOutcome::Cancelled => break,
                CycleOutcome::Discarded { .. } => {
                    tokio::select! {
                        () = shutdown.triggered() => break,
                        () = tokio::time::sleep(self.retry_delay.max(MIN_RETRY_DELAY)) => {}
                    }
                }
                _ => tokio::task::yield_now().await,
            }
        }

        let stats = self.store.stats();
        info!(
            normal = stats.normal,
            preserved = stats.preserved,
            "Recorder stopped"
        );
    }
}
