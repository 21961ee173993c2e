//! Video capture collaborator.
//!
//! The recorder only needs "write N seconds of video to this path". The
//! [`VideoCapture`] trait is that boundary; [`FfmpegCapture`] implements it
//! by running ffmpeg against a V4L2 device.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::RecordingConfig;

/// Longest stderr excerpt kept in a [`CaptureError::Failed`].
const STDERR_EXCERPT_LEN: usize = 512;

/// Errors reported by a capture collaborator.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture program could not be started.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The capture program exited unsuccessfully.
    #[error("capture exited with {status}: {stderr}")]
    Failed {
        /// Exit status.
        status: String,
        /// Tail of the program's stderr.
        stderr: String,
    },

    /// The capture device reported an error.
    #[error("capture device error: {0}")]
    Device(String),

    /// Reading the output failed.
    #[error("capture I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Produces one video segment.
#[async_trait]
pub trait VideoCapture: Send + Sync {
    /// Name of this capture source (for logging).
    fn name(&self) -> &'static str;

    /// Record `duration` of video into `path` and return the bytes written.
    ///
    /// `path` already exists and is empty. Returning `Ok(0)` is treated like
    /// a failure by the recorder.
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] if nothing usable was recorded.
    async fn capture(&self, path: &Path, duration: Duration) -> Result<u64, CaptureError>;
}

/// Captures segments by running ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    program: PathBuf,
    input_format: String,
    device: String,
    width: u32,
    height: u32,
    codec: String,
    container: String,
}

impl FfmpegCapture {
    /// Create a capture from the recording configuration.
    #[must_use]
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
            input_format: config.input_format.clone(),
            device: config.device.clone(),
            width: config.width,
            height: config.height,
            codec: config.codec.clone(),
            container: config.container.clone(),
        }
    }

    /// Command-line arguments for one capture.
    #[must_use]
    pub fn args(&self, path: &Path, duration: Duration) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            self.input_format.as_str(),
            "-i",
            self.device.as_str(),
            "-t",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        args.push(format!("{:.3}", duration.as_secs_f64()).into());
        args.push("-vf".into());
        args.push(format!("scale={}:{}", self.width, self.height).into());
        args.push("-c:v".into());
        args.push(self.codec.clone().into());
        // The .part suffix hides the container from ffmpeg's guess
        args.push("-f".into());
        args.push(self.container.clone().into());
        args.push(path.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl VideoCapture for FfmpegCapture {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn capture(&self, path: &Path, duration: Duration) -> Result<u64, CaptureError> {
        let args = self.args(path, duration);
        debug!(program = %self.program.display(), device = %self.device, "Starting capture");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CaptureError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(CaptureError::Failed {
                status: output.status.to_string(),
                stderr: stderr_excerpt(&output.stderr),
            });
        }

        Ok(tokio::fs::metadata(path).await?.len())
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_EXCERPT_LEN)
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> FfmpegCapture {
        FfmpegCapture::new(&RecordingConfig::default())
    }

    fn args_as_strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_args_follow_recording_config() {
        let args = capture().args(
            Path::new("/videos/20261016_143000.mp4.part"),
            Duration::from_secs(60),
        );

        assert_eq!(
            args_as_strings(&args),
            vec![
                "-hide_banner",
                "-loglevel",
                "error",
                "-y",
                "-f",
                "v4l2",
                "-i",
                "/dev/video0",
                "-t",
                "60.000",
                "-vf",
                "scale=1280:720",
                "-c:v",
                "libx264",
                "-f",
                "mp4",
                "/videos/20261016_143000.mp4.part",
            ]
        );
    }

    #[test]
    fn test_args_fractional_duration() {
        let args = capture().args(Path::new("out"), Duration::from_millis(1500));
        assert!(args_as_strings(&args).contains(&"1.500".to_string()));
    }

    #[test]
    fn test_args_custom_device() {
        let config = RecordingConfig {
            device: "/dev/video2".to_string(),
            width: 640,
            height: 480,
            ..RecordingConfig::default()
        };
        let capture = FfmpegCapture::new(&config);
        let args = args_as_strings(&capture.args(Path::new("out"), Duration::from_secs(1)));
        assert!(args.contains(&"/dev/video2".to_string()));
        assert!(args.contains(&"scale=640:480".to_string()));
    }

    #[test]
    fn test_stderr_excerpt_keeps_tail() {
        let long = "x".repeat(2000) + "device busy";
        let excerpt = stderr_excerpt(long.as_bytes());
        assert!(excerpt.len() <= STDERR_EXCERPT_LEN + 1);
        assert!(excerpt.ends_with("device busy"));

        assert_eq!(stderr_excerpt(b"  short \n"), "short");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let config = RecordingConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-for-tests"),
            ..RecordingConfig::default()
        };
        let dir = tempfile::TempDir::new().unwrap();
        let err = FfmpegCapture::new(&config)
            .capture(&dir.path().join("out.mp4.part"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Spawn { .. }));
    }

    #[test]
    fn test_capture_error_display() {
        let err = CaptureError::Failed {
            status: "exit status: 1".to_string(),
            stderr: "No such device".to_string(),
        };
        assert!(err.to_string().contains("No such device"));
        assert!(CaptureError::Device("unplugged".to_string())
            .to_string()
            .contains("unplugged"));
    }
}
