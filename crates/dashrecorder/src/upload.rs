//! Periodic upload of preserved crash footage.
//!
//! Uploads are best-effort: a failed upload is logged and retried on the
//! next tick, and the segment stays preserved either way.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::shutdown::ShutdownSignal;
use crate::store::SegmentStore;

/// Errors reported by an upload collaborator.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The upload program could not be started.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The upload program exited unsuccessfully.
    #[error("upload exited with {status}: {stderr}")]
    Rejected {
        /// Exit status.
        status: String,
        /// The program's stderr.
        stderr: String,
    },

    /// The remote store refused the file.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Hands a file to the remote store.
///
/// Uploading the same file twice must be harmless.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an [`UploadError`] if the upload did not complete.
    async fn upload(&self, path: &Path) -> std::result::Result<(), UploadError>;
}

/// Uploads by running a command with the file path appended.
#[derive(Debug, Clone)]
pub struct CommandUploader {
    program: String,
    args: Vec<String>,
}

impl CommandUploader {
    /// Create an uploader from a command line such as `["gdrive", "upload"]`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the command is empty.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| Error::ConfigValidation {
            message: "upload command must not be empty".to_string(),
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Create an uploader from the upload configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the command is empty.
    pub fn from_config(config: &UploadConfig) -> Result<Self> {
        Self::new(&config.command)
    }
}

#[async_trait]
impl Uploader for CommandUploader {
    async fn upload(&self, path: &Path) -> std::result::Result<(), UploadError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| UploadError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(UploadError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Result of one upload run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Segments uploaded.
    pub uploaded: Vec<String>,
    /// Segments whose upload failed; retried next run.
    pub failed: Vec<String>,
}

/// Periodically uploads every preserved segment.
pub struct UploadScheduler {
    store: Arc<SegmentStore>,
    uploader: Arc<dyn Uploader>,
    interval: Duration,
}

impl fmt::Debug for UploadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadScheduler")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl UploadScheduler {
    /// Create a scheduler running every `interval`.
    #[must_use]
    pub fn new(store: Arc<SegmentStore>, uploader: Arc<dyn Uploader>, interval: Duration) -> Self {
        Self {
            store,
            uploader,
            interval,
        }
    }

    /// Upload every segment currently preserved.
    pub async fn upload_preserved(&self) -> UploadReport {
        let mut report = UploadReport::default();
        let preserved: Vec<_> = self
            .store
            .list_segments()
            .into_iter()
            .filter(|segment| segment.is_preserved())
            .collect();

        for segment in preserved {
            match self.uploader.upload(&segment.path).await {
                Ok(()) => {
                    info!(segment = %segment.name, "Segment uploaded");
                    report.uploaded.push(segment.name);
                }
                Err(e) => {
                    warn!(segment = %segment.name, error = %e, "Upload failed, retrying next run");
                    report.failed.push(segment.name);
                }
            }
        }
        report
    }

    /// Upload on every tick until shutdown. The first run is immediate.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Upload scheduler started");

        loop {
            tokio::select! {
                () = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            let report = tokio::select! {
                () = shutdown.triggered() => break,
                report = self.upload_preserved() => report,
            };
            debug!(
                uploaded = report.uploaded.len(),
                failed = report.failed.len(),
                "Upload run finished"
            );
        }

        info!("Upload scheduler stopped");
    }
}
