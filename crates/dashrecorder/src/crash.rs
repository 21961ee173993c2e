//! Crash detection loop.
//!
//! The detector polls the accelerometer and, when the reading's magnitude
//! exceeds the threshold, preserves the newest completed segment. Repeated
//! breaches are harmless: preserving an already-preserved segment is a
//! no-op. An optional cooldown suppresses the repeats.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::segment::Segment;
use crate::sensor::{AccelerationSensor, SensorError};
use crate::shutdown::ShutdownSignal;
use crate::store::SegmentStore;

/// Pause after a failed sensor read.
const SENSOR_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A threshold breach. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashEvent {
    /// When the reading was taken.
    pub observed_at: DateTime<Utc>,
    /// Acceleration magnitude in g.
    pub magnitude: f64,
}

/// What one poll observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// The reading was at or below the threshold.
    Quiet {
        /// Acceleration magnitude in g.
        magnitude: f64,
    },
    /// A crash preserved a segment.
    Preserved {
        /// The breach.
        event: CrashEvent,
        /// The preserved segment.
        segment: Segment,
    },
    /// A crash found no completed segment to preserve.
    Missed(CrashEvent),
    /// A breach inside the cooldown window; nothing was done.
    CoolingDown(CrashEvent),
    /// Preserving failed; the error was logged.
    Failed(CrashEvent),
}

/// Polls a sensor and preserves footage on impact.
pub struct CrashDetector {
    store: Arc<SegmentStore>,
    sensor: Arc<dyn AccelerationSensor>,
    threshold_g: f64,
    poll_interval: Duration,
    cooldown: Duration,
    last_crash: Mutex<Option<Instant>>,
}

impl fmt::Debug for CrashDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashDetector")
            .field("threshold_g", &self.threshold_g)
            .field("poll_interval", &self.poll_interval)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl CrashDetector {
    /// Create a detector that fires above `threshold_g`.
    #[must_use]
    pub fn new(
        store: Arc<SegmentStore>,
        sensor: Arc<dyn AccelerationSensor>,
        threshold_g: f64,
    ) -> Self {
        Self {
            store,
            sensor,
            threshold_g,
            poll_interval: Duration::ZERO,
            cooldown: Duration::ZERO,
            last_crash: Mutex::new(None),
        }
    }

    /// Wait `interval` between reads. Zero polls continuously.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Ignore breaches for `cooldown` after a crash. Zero disables it.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Read the sensor once and react to a breach.
    ///
    /// # Errors
    ///
    /// Returns the sensor's error if the read failed.
    pub fn poll_once(&self) -> Result<Detection, SensorError> {
        let reading = self.sensor.read_acceleration()?;
        let magnitude = reading.magnitude();
        if magnitude <= self.threshold_g {
            return Ok(Detection::Quiet { magnitude });
        }

        let event = CrashEvent {
            observed_at: Utc::now(),
            magnitude,
        };
        if self.in_cooldown() {
            debug!(magnitude, "Breach inside cooldown window ignored");
            return Ok(Detection::CoolingDown(event));
        }

        warn!(magnitude, threshold_g = self.threshold_g, "Crash detected");
        Ok(match self.store.preserve_most_recent_completed() {
            Ok(Some(segment)) => {
                info!(segment = %segment.name, magnitude, "Crash footage preserved");
                Detection::Preserved { event, segment }
            }
            Ok(None) => {
                warn!(magnitude, "Crash detected before any segment completed, nothing preserved");
                Detection::Missed(event)
            }
            Err(e) => {
                warn!(error = %e, magnitude, "Failed to preserve crash footage");
                Detection::Failed(event)
            }
        })
    }

    /// Whether a crash happened within the cooldown; starts a new window if not.
    fn in_cooldown(&self) -> bool {
        if self.cooldown.is_zero() {
            return false;
        }
        let now = Instant::now();
        let mut last = self.last_crash.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.cooldown => true,
            _ => {
                *last = Some(now);
                false
            }
        }
    }

    /// Poll until shutdown.
    ///
    /// Sensor reads run on the blocking pool. A failed read is logged and
    /// retried after a short backoff.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        info!(
            threshold_g = self.threshold_g,
            poll_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Crash detector started"
        );

        while !shutdown.is_triggered() {
            let detector = Arc::clone(&self);
            let pause = match tokio::task::spawn_blocking(move || detector.poll_once()).await {
                Ok(Ok(_)) => self.poll_interval,
                Ok(Err(e)) => {
                    warn!(error = %e, "Sensor read failed");
                    SENSOR_ERROR_BACKOFF.max(self.poll_interval)
                }
                Err(e) => {
                    warn!(error = %e, "Sensor task failed");
                    SENSOR_ERROR_BACKOFF.max(self.poll_interval)
                }
            };

            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    () = shutdown.triggered() => break,
                    () = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("Crash detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentState;
    use crate::sensor::Acceleration;
    use crate::store::StoreOptions;
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Replays readings, then repeats the last one.
    struct ScriptedSensor {
        readings: Mutex<VecDeque<Result<Acceleration, String>>>,
        reads: AtomicUsize,
    }

    impl ScriptedSensor {
        fn new(readings: Vec<Result<Acceleration, String>>) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings.into()),
                reads: AtomicUsize::new(0),
            })
        }

        fn resting() -> Arc<Self> {
            Self::new(vec![Ok(Acceleration::new(0.0, 0.0, 1.0))])
        }

        fn impact() -> Arc<Self> {
            Self::new(vec![Ok(Acceleration::new(2.5, 0.5, 1.0))])
        }
    }

    impl AccelerationSensor for ScriptedSensor {
        fn read_acceleration(&self) -> Result<Acceleration, SensorError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut readings = self.readings.lock();
            let next = if readings.len() > 1 {
                readings.pop_front()
            } else {
                readings.front().cloned()
            };
            match next {
                Some(Ok(reading)) => Ok(reading),
                Some(Err(message)) => Err(SensorError::Unavailable(message)),
                None => Err(SensorError::Unavailable("no readings".to_string())),
            }
        }
    }

    fn store_with_segments(count: i64) -> (TempDir, Arc<SegmentStore>, Vec<String>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SegmentStore::open(dir.path(), StoreOptions::default()).unwrap());
        let base = DateTime::parse_from_rfc3339("2026-10-16T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let names = (0..count)
            .map(|i| {
                let handle = store
                    .begin_segment_at(base + ChronoDuration::minutes(i))
                    .unwrap();
                fs::write(handle.path(), b"video").unwrap();
                store.complete_segment(handle, 5).unwrap().name
            })
            .collect();
        (dir, store, names)
    }

    #[test]
    fn test_quiet_reading_preserves_nothing() {
        let (_dir, store, _) = store_with_segments(2);
        let detector = CrashDetector::new(Arc::clone(&store), ScriptedSensor::resting(), 2.0);

        match detector.poll_once().unwrap() {
            Detection::Quiet { magnitude } => assert!((magnitude - 1.0).abs() < 1e-9),
            other => panic!("expected quiet, got {other:?}"),
        }
        assert_eq!(store.stats().preserved, 0);
    }

    #[test]
    fn test_impact_preserves_newest_completed_segment() {
        let (_dir, store, names) = store_with_segments(3);
        let detector = CrashDetector::new(Arc::clone(&store), ScriptedSensor::impact(), 2.0);

        match detector.poll_once().unwrap() {
            Detection::Preserved { event, segment } => {
                assert!(event.magnitude > 2.0);
                assert_eq!(segment.name, names[2]);
            }
            other => panic!("expected preservation, got {other:?}"),
        }
        assert_eq!(store.get(&names[2]).unwrap().state, SegmentState::Preserved);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let (_dir, store, _) = store_with_segments(1);
        let sensor = ScriptedSensor::new(vec![Ok(Acceleration::new(0.0, 0.0, 2.0))]);
        let detector = CrashDetector::new(Arc::clone(&store), sensor, 2.0);

        assert!(matches!(detector.poll_once().unwrap(), Detection::Quiet { .. }));
    }

    #[test]
    fn test_repeated_breaches_keep_one_segment_preserved() {
        let (_dir, store, names) = store_with_segments(3);
        let detector = CrashDetector::new(Arc::clone(&store), ScriptedSensor::impact(), 2.0);

        for _ in 0..5 {
            assert!(matches!(
                detector.poll_once().unwrap(),
                Detection::Preserved { .. }
            ));
        }
        assert_eq!(store.stats().preserved, 1);
        assert!(store.get(&names[2]).unwrap().is_preserved());
    }

    #[test]
    fn test_crash_before_any_segment_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SegmentStore::open(dir.path(), StoreOptions::default()).unwrap());
        let _active = store.begin_segment().unwrap();
        let detector = CrashDetector::new(Arc::clone(&store), ScriptedSensor::impact(), 2.0);

        assert!(matches!(detector.poll_once().unwrap(), Detection::Missed(_)));
        assert_eq!(store.stats().active, 1);
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let (_dir, store, _) = store_with_segments(2);
        let detector = CrashDetector::new(Arc::clone(&store), ScriptedSensor::impact(), 2.0)
            .with_cooldown(Duration::from_secs(60));

        assert!(matches!(detector.poll_once().unwrap(), Detection::Preserved { .. }));
        assert!(matches!(detector.poll_once().unwrap(), Detection::CoolingDown(_)));
    }

    #[test]
    fn test_sensor_error_is_returned() {
        let (_dir, store, _) = store_with_segments(1);
        let sensor = ScriptedSensor::new(vec![Err("i2c timeout".to_string())]);
        let detector = CrashDetector::new(Arc::clone(&store), sensor, 2.0);

        assert!(detector.poll_once().is_err());
        assert_eq!(store.stats().preserved, 0);
    }

    #[tokio::test]
    async fn test_run_polls_until_shutdown() {
        let (_dir, store, names) = store_with_segments(2);
        let sensor = ScriptedSensor::new(vec![
            Ok(Acceleration::new(0.0, 0.0, 1.0)),
            Ok(Acceleration::new(0.0, 0.0, 1.0)),
            Ok(Acceleration::new(3.0, 0.0, 0.0)),
            Ok(Acceleration::new(0.0, 0.0, 1.0)),
        ]);
        let detector = Arc::new(
            CrashDetector::new(Arc::clone(&store), sensor.clone(), 2.0)
                .with_poll_interval(Duration::from_millis(1)),
        );
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(Arc::clone(&detector).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert!(sensor.reads.load(Ordering::SeqCst) >= 4);
        assert!(store.get(&names[1]).unwrap().is_preserved());
        assert!(!store.get(&names[0]).unwrap().is_preserved());
    }

    #[tokio::test]
    async fn test_run_survives_sensor_errors() {
        let (_dir, store, _) = store_with_segments(1);
        let sensor = ScriptedSensor::new(vec![Err("bus error".to_string())]);
        let detector = Arc::new(CrashDetector::new(Arc::clone(&store), sensor.clone(), 2.0));
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(Arc::clone(&detector).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        // The backoff sleep is interrupted by shutdown
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sensor.reads.load(Ordering::SeqCst), 1);
    }
}
