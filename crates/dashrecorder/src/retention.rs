//! Retention policy for the segment directory.
//!
//! Two limits are applied, in this order:
//!
//! 1. **Count cap**: normal and preserved segments together are held to
//!    `max_normal_segments`; the oldest excess normal ones are evicted.
//!    Preserved segments use up slots but are never evicted, so enough
//!    crash footage leaves no normal segment at all.
//! 2. **Disk pressure**: while the volume's free ratio is below
//!    `min_free_ratio`, the oldest normal segment is evicted, down to
//!    `floor_segments`. If pressure persists at the floor, a
//!    [`StorageCritical`] condition is reported. Preserved segments are never
//!    touched to make room.
//!
//! Every eviction goes through [`SegmentStore::evict`], which re-checks the
//! segment's state under the store lock. A segment preserved since the scan
//! is skipped.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RetentionConfig;
use crate::ledger::IntegrityLedger;
use crate::segment::Segment;
use crate::shutdown::ShutdownSignal;
use crate::store::SegmentStore;

/// Limits applied by [`RetentionPolicy::enforce`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionLimits {
    /// Slots for completed segments, preserved ones included; only normal
    /// segments are evicted to fit. `0` means unlimited.
    pub max_normal_segments: usize,
    /// Free-space ratio below which disk-pressure eviction starts; `0`
    /// disables it.
    pub min_free_ratio: f64,
    /// Disk-pressure eviction never goes below this many normal segments.
    pub floor_segments: usize,
    /// Keep ledger entries of evicted segments.
    pub keep_ledger_tombstones: bool,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            max_normal_segments: 10,
            min_free_ratio: 0.10,
            floor_segments: 5,
            keep_ledger_tombstones: false,
        }
    }
}

impl From<&RetentionConfig> for RetentionLimits {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            max_normal_segments: config.max_normal_segments,
            min_free_ratio: config.min_free_ratio,
            floor_segments: config.floor_segments,
            keep_ledger_tombstones: config.keep_ledger_tombstones,
        }
    }
}

/// Source of the storage volume's free-space ratio.
pub trait SpaceProbe: Send + Sync {
    /// Free space as a fraction of the volume size, in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the volume cannot be queried.
    fn free_ratio(&self) -> io::Result<f64>;
}

/// [`SpaceProbe`] for the volume holding a directory.
#[derive(Debug, Clone)]
pub struct VolumeSpaceProbe {
    path: PathBuf,
}

impl VolumeSpaceProbe {
    /// Probe the volume that holds `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpaceProbe for VolumeSpaceProbe {
    #[allow(clippy::cast_precision_loss)]
    fn free_ratio(&self) -> io::Result<f64> {
        let total = fs2::total_space(&self.path)?;
        if total == 0 {
            return Ok(0.0);
        }
        let available = fs2::available_space(&self.path)?;
        Ok(available as f64 / total as f64)
    }
}

/// Disk pressure persisted after evicting down to the floor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageCritical {
    /// Free ratio measured at the floor.
    pub free_ratio: f64,
    /// Configured threshold.
    pub min_free_ratio: f64,
    /// Normal segments left.
    pub normal_segments: usize,
    /// Preserved segments, which retention will not touch.
    pub preserved_segments: usize,
}

impl fmt::Display for StorageCritical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "storage critical: free ratio {:.3} below {:.3}, {} normal and {} preserved left",
            self.free_ratio, self.min_free_ratio, self.normal_segments, self.preserved_segments
        )
    }
}

/// What one call to [`RetentionPolicy::enforce`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    /// Segments evicted, in eviction order.
    pub evicted: Vec<String>,
    /// Candidates skipped because their state changed since the scan.
    pub skipped: Vec<String>,
    /// Candidates whose eviction failed with an I/O error.
    pub failed: Vec<String>,
    /// Last measured free ratio, if the pressure stage ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_ratio: Option<f64>,
    /// Set when disk pressure could not be relieved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical: Option<StorageCritical>,
}

impl RetentionReport {
    /// Whether nothing was evicted, skipped or failed.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.evicted.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

enum Outcome {
    Evicted,
    Skipped,
    Failed,
}

/// Decides which normal segments to evict and evicts them.
pub struct RetentionPolicy {
    store: Arc<SegmentStore>,
    ledger: Option<Arc<IntegrityLedger>>,
    probe: Box<dyn SpaceProbe>,
    limits: RetentionLimits,
}

impl fmt::Debug for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionPolicy")
            .field("dir", &self.store.dir())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl RetentionPolicy {
    /// Create a policy over `store`.
    #[must_use]
    pub fn new(
        store: Arc<SegmentStore>,
        probe: Box<dyn SpaceProbe>,
        limits: RetentionLimits,
    ) -> Self {
        Self {
            store,
            ledger: None,
            probe,
            limits,
        }
    }

    /// Remove ledger entries of evicted segments from `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<IntegrityLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// The limits this policy applies.
    #[must_use]
    pub fn limits(&self) -> &RetentionLimits {
        &self.limits
    }

    /// Apply the count cap, then the disk-pressure cap.
    ///
    /// Never fails: races are skipped, I/O errors are logged and recorded in
    /// the report, and persistent pressure is reported as
    /// [`StorageCritical`].
    pub fn enforce(&self) -> RetentionReport {
        let mut report = RetentionReport::default();
        self.enforce_count_cap(&mut report);
        self.enforce_pressure(&mut report);

        if !report.is_quiet() {
            info!(
                evicted = report.evicted.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Retention enforced"
            );
        }
        report
    }

    fn normal_segments(&self) -> Vec<Segment> {
        self.store
            .list_segments()
            .into_iter()
            .filter(Segment::is_evictable)
            .collect()
    }

    fn enforce_count_cap(&self, report: &mut RetentionReport) {
        let max = self.limits.max_normal_segments;
        if max == 0 {
            return;
        }

        // Preserved segments take up slots but are never evicted. Oldest
        // first, so the excess is the head of the list.
        let normal = self.normal_segments();
        let preserved = self.store.stats().preserved;
        let excess = (normal.len() + preserved)
            .saturating_sub(max)
            .min(normal.len());
        if excess > 0 {
            debug!(normal = normal.len(), preserved, max, excess, "Count cap exceeded");
        }
        for segment in normal.iter().take(excess) {
            self.evict_one(&segment.name, report);
        }
    }

    fn enforce_pressure(&self, report: &mut RetentionReport) {
        let min = self.limits.min_free_ratio;
        if min <= 0.0 {
            return;
        }

        loop {
            let ratio = match self.probe.free_ratio() {
                Ok(ratio) => ratio,
                Err(e) => {
                    warn!(error = %e, "Failed to measure free space");
                    return;
                }
            };
            report.free_ratio = Some(ratio);
            if ratio >= min {
                return;
            }

            let normal = self.normal_segments();
            if normal.len() <= self.limits.floor_segments {
                let critical = StorageCritical {
                    free_ratio: ratio,
                    min_free_ratio: min,
                    normal_segments: normal.len(),
                    preserved_segments: self.store.stats().preserved,
                };
                error!(
                    free_ratio = ratio,
                    min_free_ratio = min,
                    normal = critical.normal_segments,
                    preserved = critical.preserved_segments,
                    "Storage critical, recording continues"
                );
                report.critical = Some(critical);
                return;
            }

            let Some(oldest) = normal.first() else {
                return;
            };
            debug!(free_ratio = ratio, min_free_ratio = min, "Disk pressure");
            if let Outcome::Failed = self.evict_one(&oldest.name, report) {
                // The same candidate would fail again
                return;
            }
        }
    }

    fn evict_one(&self, name: &str, report: &mut RetentionReport) -> Outcome {
        match self.store.evict(name) {
            Ok(segment) => {
                info!(segment = %name, bytes = segment.size_bytes, "Segment evicted");
                if !self.limits.keep_ledger_tombstones {
                    if let Some(ledger) = &self.ledger {
                        if let Err(e) = ledger.remove(name) {
                            warn!(segment = %name, error = %e, "Failed to drop ledger entry");
                        }
                    }
                }
                report.evicted.push(name.to_string());
                Outcome::Evicted
            }
            Err(e) if e.is_invalid_transition() => {
                debug!(segment = %name, reason = %e, "Eviction candidate changed state, skipping");
                report.skipped.push(name.to_string());
                Outcome::Skipped
            }
            Err(e) => {
                warn!(segment = %name, error = %e, "Failed to evict segment");
                report.failed.push(name.to_string());
                Outcome::Failed
            }
        }
    }

    /// Run [`enforce`](Self::enforce) every `interval` until shutdown.
    ///
    /// The first run happens immediately. A zero interval disables the timer
    /// and the call just waits for shutdown.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) {
        if interval.is_zero() {
            debug!("Periodic retention disabled");
            shutdown.triggered().await;
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Periodic retention started");

        loop {
            tokio::select! {
                () = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            let policy = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || policy.enforce()).await {
                warn!(error = %e, "Retention task failed");
            }
        }

        info!("Periodic retention stopped");
    }
}
