//! Wiring of the recording pipeline.
//!
//! A [`Daemon`] owns the store and ledger and runs four loops until
//! shutdown: the recorder, the crash detector, periodic retention and
//! (optionally) uploads. The loops share nothing but the store, the
//! ledger and the shutdown signal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::capture::{FfmpegCapture, VideoCapture};
use crate::config::Config;
use crate::crash::CrashDetector;
use crate::error::Result;
use crate::ledger::IntegrityLedger;
use crate::recorder::Recorder;
use crate::retention::{RetentionLimits, RetentionPolicy, SpaceProbe, VolumeSpaceProbe};
use crate::sensor::{AccelerationSensor, IioAccelerometer};
use crate::shutdown::ShutdownSignal;
use crate::store::{SegmentStore, StoreOptions};
use crate::upload::{CommandUploader, UploadScheduler, Uploader};

/// The external devices and services the pipeline talks to.
pub struct Collaborators {
    /// Video source.
    pub capture: Arc<dyn VideoCapture>,
    /// Accelerometer.
    pub sensor: Arc<dyn AccelerationSensor>,
    /// Remote store; `None` disables uploads.
    pub uploader: Option<Arc<dyn Uploader>>,
    /// Free-space probe; `None` probes the volume holding the store.
    pub space_probe: Option<Box<dyn SpaceProbe>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("capture", &self.capture.name())
            .field("uploader", &self.uploader.is_some())
            .field("space_probe", &self.space_probe.is_some())
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    /// ffmpeg capture, IIO accelerometer and command uploader as configured.
    ///
    /// # Errors
    ///
    /// Returns a validation error if uploads are enabled with no command.
    pub fn from_config(config: &Config) -> Result<Self> {
        let uploader: Option<Arc<dyn Uploader>> = if config.upload.enabled {
            Some(Arc::new(CommandUploader::from_config(&config.upload)?))
        } else {
            None
        };

        Ok(Self {
            capture: Arc::new(FfmpegCapture::new(&config.recording)),
            sensor: Arc::new(IioAccelerometer::new(&config.crash.sensor_device)),
            uploader,
            space_probe: None,
        })
    }
}

/// The assembled pipeline.
pub struct Daemon {
    store: Arc<SegmentStore>,
    ledger: Arc<IntegrityLedger>,
    retention: Arc<RetentionPolicy>,
    recorder: Arc<Recorder>,
    detector: Arc<CrashDetector>,
    uploads: Option<Arc<UploadScheduler>>,
    pressure_check_interval: Duration,
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("store", &self.store.dir())
            .field("ledger", &self.ledger.path())
            .field("uploads", &self.uploads.is_some())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build the pipeline with the configured collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be opened (including when another process holds it).
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::from_config(config)?)
    }

    /// Build the pipeline with the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be opened (including when another process holds it).
    pub fn with_collaborators(config: &Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let options = StoreOptions {
            extension: config.storage.segment_extension.clone(),
            ..StoreOptions::default()
        };
        let store = Arc::new(SegmentStore::open(config.video_dir(), options)?);
        let ledger = Arc::new(IntegrityLedger::open(
            config.ledger_path(),
            Arc::clone(&store),
        ));

        let probe = collaborators
            .space_probe
            .unwrap_or_else(|| Box::new(VolumeSpaceProbe::new(store.dir())));
        let retention = Arc::new(
            RetentionPolicy::new(
                Arc::clone(&store),
                probe,
                RetentionLimits::from(&config.retention),
            )
            .with_ledger(Arc::clone(&ledger)),
        );

        let recorder = Arc::new(
            Recorder::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&retention),
                collaborators.capture,
                config.segment_duration(),
            )
            .with_retry_delay(config.retry_delay()),
        );

        let detector = Arc::new(
            CrashDetector::new(
                Arc::clone(&store),
                collaborators.sensor,
                config.crash.threshold_g,
            )
            .with_poll_interval(config.poll_interval())
            .with_cooldown(config.crash_cooldown()),
        );

        let uploads = collaborators.uploader.map(|uploader| {
            Arc::new(UploadScheduler::new(
                Arc::clone(&store),
                uploader,
                config.upload_interval(),
            ))
        });

        Ok(Self {
            store,
            ledger,
            retention,
            recorder,
            detector,
            uploads,
            pressure_check_interval: config.pressure_check_interval(),
        })
    }

    /// The segment store.
    #[must_use]
    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// The integrity ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<IntegrityLedger> {
        &self.ledger
    }

    /// Run every loop until `shutdown` fires and all of them have stopped.
    ///
    /// A loop that panics is logged; the others keep running.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let stats = self.store.stats();
        info!(
            dir = %self.store.dir().display(),
            normal = stats.normal,
            preserved = stats.preserved,
            ledger_entries = self.ledger.len(),
            "Dashrecorder started"
        );

        let mut tasks = JoinSet::new();

        let recorder = Arc::clone(&self.recorder);
        let signal = shutdown.clone();
        tasks.spawn(async move { recorder.run(signal).await });

        tasks.spawn(Arc::clone(&self.detector).run(shutdown.clone()));

        tasks.spawn(
            Arc::clone(&self.retention)
                .run_periodic(self.pressure_check_interval, shutdown.clone()),
        );

        if let Some(uploads) = &self.uploads {
            let uploads = Arc::clone(uploads);
            let signal = shutdown.clone();
            tasks.spawn(async move { uploads.run(signal).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pipeline task failed");
            }
        }

        let stats = self.store.stats();
        info!(
            normal = stats.normal,
            preserved = stats.preserved,
            "Dashrecorder stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use crate::sensor::{Acceleration, SensorError};
    use async_trait::async_trait;
    use std::io;
    use std::path::Path;
    use tempfile::TempDir;

    struct NoCapture;

    #[async_trait]
    impl VideoCapture for NoCapture {
        fn name(&self) -> &'static str {
            "none"
        }

        async fn capture(
            &self,
            _path: &Path,
            _duration: Duration,
        ) -> std::result::Result<u64, CaptureError> {
            Err(CaptureError::Device("no camera".to_string()))
        }
    }

    struct Still;

    impl AccelerationSensor for Still {
        fn read_acceleration(&self) -> std::result::Result<Acceleration, SensorError> {
            Ok(Acceleration::new(0.0, 0.0, 1.0))
        }
    }

    struct Roomy;

    impl SpaceProbe for Roomy {
        fn free_ratio(&self) -> io::Result<f64> {
            Ok(0.9)
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            capture: Arc::new(NoCapture),
            sensor: Arc::new(Still),
            uploader: None,
            space_probe: Some(Box::new(Roomy)),
        }
    }

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.video_dir = Some(dir.path().join("videos"));
        config.recording.retry_delay_ms = 10;
        config.crash.poll_interval_ms = 10;
        config
    }

    #[test]
    fn test_collaborators_from_config() {
        let mut config = Config::default();
        let collaborators = Collaborators::from_config(&config).unwrap();
        assert_eq!(collaborators.capture.name(), "ffmpeg");
        assert!(collaborators.uploader.is_some());

        config.upload.enabled = false;
        assert!(Collaborators::from_config(&config).unwrap().uploader.is_none());

        config.upload.enabled = true;
        config.upload.command.clear();
        assert!(Collaborators::from_config(&config).is_err());
    }

    #[test]
    fn test_second_daemon_on_same_dir_is_refused() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let first = Daemon::with_collaborators(&config, collaborators()).unwrap();
        assert_eq!(first.store().dir(), dir.path().join("videos"));
        assert_eq!(first.ledger().path(), config.ledger_path());

        let err = Daemon::with_collaborators(&config, collaborators()).unwrap_err();
        assert!(err.is_locked());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.recording.segment_duration_secs = 0;
        assert!(Daemon::with_collaborators(&config, collaborators()).is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::with_collaborators(&config_in(&dir), collaborators()).unwrap();
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(daemon.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
