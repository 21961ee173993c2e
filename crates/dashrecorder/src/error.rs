//! Error types for dashrecorder.
//!
//! This module defines the crate-wide error type. Collaborator boundaries
//! (capture, sensor, upload) carry their own error enums in their modules.

use std::path::PathBuf;
use thiserror::Error;

use crate::segment::SegmentState;

/// The main error type for dashrecorder operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Segment Store Errors ===
    /// No free name could be derived for a new segment.
    #[error("could not allocate a unique segment name from {name}")]
    NameCollision {
        /// The time-derived base name that kept colliding.
        name: String,
    },

    /// A capture finished without writing any bytes.
    #[error("segment {name} was completed with no data")]
    WriteIncomplete {
        /// Name of the discarded segment.
        name: String,
    },

    /// A state transition is not permitted from the segment's current state.
    #[error("segment {name} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Name of the segment.
        name: String,
        /// State the segment was found in.
        from: SegmentState,
        /// State that was requested.
        to: SegmentState,
    },

    /// The store has no segment with the given name.
    #[error("segment not found: {name}")]
    SegmentNotFound {
        /// Name that was looked up.
        name: String,
    },

    /// Another process holds the store's writer lock.
    #[error("segment directory {path} is locked by another process")]
    StoreLocked {
        /// Path to the lock file.
        path: PathBuf,
    },

    /// A mutating call was made on a store opened read-only.
    #[error("segment store was opened read-only")]
    ReadOnly,

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for dashrecorder operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an invalid transition error.
    #[must_use]
    pub fn invalid_transition(
        name: impl Into<String>,
        from: SegmentState,
        to: SegmentState,
    ) -> Self {
        Self::InvalidTransition {
            name: name.into(),
            from,
            to,
        }
    }

    /// Create a segment-not-found error.
    #[must_use]
    pub fn segment_not_found(name: impl Into<String>) -> Self {
        Self::SegmentNotFound { name: name.into() }
    }

    /// Check if this error is a refused state transition.
    ///
    /// During retention this means the segment was preserved or evicted
    /// concurrently, and the caller should skip it.
    #[must_use]
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    /// Check if this error means the store is held by another process.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::StoreLocked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ReadOnly;
        assert_eq!(err.to_string(), "segment store was opened read-only");

        let err = Error::internal("test error");
        assert_eq!(err.to_string(), "internal error: test error");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::invalid_transition(
            "20261016_143000",
            SegmentState::Preserved,
            SegmentState::Evicted,
        );
        let msg = err.to_string();
        assert!(msg.contains("20261016_143000"));
        assert!(msg.contains("preserved"));
        assert!(msg.contains("evicted"));
        assert!(err.is_invalid_transition());
    }

    #[test]
    fn test_is_invalid_transition() {
        assert!(!Error::ReadOnly.is_invalid_transition());
        assert!(!Error::segment_not_found("x").is_invalid_transition());
    }

    #[test]
    fn test_is_locked() {
        let err = Error::StoreLocked {
            path: PathBuf::from("/videos/.dashrecorder.lock"),
        };
        assert!(err.is_locked());
        assert!(err.to_string().contains("/videos/.dashrecorder.lock"));
        assert!(!Error::ReadOnly.is_locked());
    }

    #[test]
    fn test_write_incomplete_display() {
        let err = Error::WriteIncomplete {
            name: "20261016_143000".to_string(),
        };
        assert!(err.to_string().contains("no data"));
    }

    #[test]
    fn test_name_collision_display() {
        let err = Error::NameCollision {
            name: "20261016_143000".to_string(),
        };
        assert!(err.to_string().contains("20261016_143000"));
    }

    #[test]
    fn test_segment_not_found_display() {
        let err = Error::segment_not_found("20261016_143000");
        assert_eq!(err.to_string(), "segment not found: 20261016_143000");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "segment_duration_secs must be greater than 0".to_string(),
        };
        assert!(err.to_string().contains("segment_duration_secs"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("/root/forbidden"));
    }
}
