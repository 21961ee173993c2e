//! Configuration management for dashrecorder.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ledger::LEDGER_FILE_NAME;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "dashrecorder";

/// Default segment directory name inside the data directory.
const VIDEO_DIR_NAME: &str = "videos";

/// Prefix of configuration environment variables.
const ENV_PREFIX: &str = "DASHRECORDER_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `DASHRECORDER_`, sections
///    separated by `__`, e.g. `DASHRECORDER_RETENTION__MAX_NORMAL_SEGMENTS`)
/// 2. TOML config file at `~/.config/dashrecorder/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Recording configuration.
    pub recording: RecordingConfig,
    /// Retention configuration.
    pub retention: RetentionConfig,
    /// Crash detection configuration.
    pub crash: CrashConfig,
    /// Upload configuration.
    pub upload: UploadConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding segments and the ledger.
    /// Defaults to `~/.local/share/dashrecorder/videos`
    pub video_dir: Option<PathBuf>,
    /// Segment file extension, without the dot.
    pub segment_extension: String,
    /// Ledger file name, relative to the video directory.
    pub ledger_file: String,
}

/// Recording-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Length of one segment in seconds.
    pub segment_duration_secs: u64,
    /// Pause after a discarded capture, in milliseconds. The recorder never
    /// waits less than 100 ms.
    pub retry_delay_ms: u64,
    /// ffmpeg executable.
    pub ffmpeg_path: PathBuf,
    /// ffmpeg input format (`-f` before `-i`).
    pub input_format: String,
    /// Capture device.
    pub device: String,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Video codec.
    pub codec: String,
    /// Output container format.
    pub container: String,
}

/// Retention-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Completed segments to keep, crash footage included. Only normal
    /// segments are evicted to meet it. Set to 0 for unlimited.
    pub max_normal_segments: usize,
    /// Free-space ratio below which old segments are evicted.
    /// Set to 0 to disable the disk-pressure check.
    pub min_free_ratio: f64,
    /// Disk-pressure eviction stops at this many normal segments.
    pub floor_segments: usize,
    /// Interval of the periodic disk-pressure check in seconds.
    /// Set to 0 to only enforce after each segment.
    pub pressure_check_interval_secs: u64,
    /// Keep ledger entries of evicted segments.
    pub keep_ledger_tombstones: bool,
}

/// Crash detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    /// Acceleration magnitude in g above which a crash is recorded.
    pub threshold_g: f64,
    /// Delay between sensor reads in milliseconds. 0 polls continuously.
    pub poll_interval_ms: u64,
    /// Ignore further breaches for this long after a crash, in milliseconds.
    /// 0 disables the cooldown.
    pub cooldown_ms: u64,
    /// Linux IIO device directory of the accelerometer.
    pub sensor_device: PathBuf,
}

/// Upload-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Upload preserved segments.
    pub enabled: bool,
    /// Interval between upload runs in seconds.
    pub interval_secs: u64,
    /// Upload command; the segment path is appended as the last argument.
    pub command: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            video_dir: None, // Will be resolved to default at runtime
            segment_extension: "mp4".to_string(),
            ledger_file: LEDGER_FILE_NAME.to_string(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: 60,
            retry_delay_ms: 0,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            input_format: "v4l2".to_string(),
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            codec: "libx264".to_string(),
            container: "mp4".to_string(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_normal_segments: 10,
            min_free_ratio: 0.10,
            floor_segments: 5,
            pressure_check_interval_secs: 30,
            keep_ledger_tombstones: false,
        }
    }
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            threshold_g: 2.0,
            poll_interval_ms: 0,
            cooldown_ms: 0,
            sensor_device: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            command: vec!["gdrive".to_string(), "upload".to_string()],
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `DASHRECORDER_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;
        if storage.segment_extension.is_empty()
            || !storage
                .segment_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid(format!(
                "segment_extension must be non-empty ASCII alphanumeric, got {:?}",
                storage.segment_extension
            )));
        }
        if storage.ledger_file.trim().is_empty() {
            return Err(invalid("ledger_file must not be empty"));
        }

        let recording = &self.recording;
        if recording.segment_duration_secs == 0 {
            return Err(invalid("segment_duration_secs must be greater than 0"));
        }
        if recording.width == 0 || recording.height == 0 {
            return Err(invalid(format!(
                "width and height must be greater than 0, got {}x{}",
                recording.width, recording.height
            )));
        }

        let ratio = self.retention.min_free_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return Err(invalid(format!(
                "min_free_ratio must be in [0, 1), got {ratio}"
            )));
        }

        let threshold = self.crash.threshold_g;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(invalid(format!(
                "threshold_g must be a positive number, got {threshold}"
            )));
        }

        if self.upload.enabled {
            if self.upload.interval_secs == 0 {
                return Err(invalid("upload interval_secs must be greater than 0"));
            }
            if self.upload.command.is_empty() {
                return Err(invalid("upload command must not be empty"));
            }
        }

        Ok(())
    }

    /// Get the segment directory, resolving defaults if not set.
    #[must_use]
    pub fn video_dir(&self) -> PathBuf {
        self.storage
            .video_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(VIDEO_DIR_NAME))
    }

    /// Get the ledger file path.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.video_dir().join(&self.storage.ledger_file)
    }

    /// Get the segment duration as a Duration.
    #[must_use]
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.recording.segment_duration_secs)
    }

    /// Get the retry delay as a Duration.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.recording.retry_delay_ms)
    }

    /// Get the disk-pressure check interval as a Duration.
    #[must_use]
    pub fn pressure_check_interval(&self) -> Duration {
        Duration::from_secs(self.retention.pressure_check_interval_secs)
    }

    /// Get the sensor poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.crash.poll_interval_ms)
    }

    /// Get the crash cooldown as a Duration.
    #[must_use]
    pub fn crash_cooldown(&self) -> Duration {
        Duration::from_millis(self.crash.cooldown_ms)
    }

    /// Get the upload interval as a Duration.
    #[must_use]
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload.interval_secs)
    }
}
