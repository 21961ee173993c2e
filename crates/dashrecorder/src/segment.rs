//! Core segment types for dashrecorder.
//!
//! A segment is one recorded video file covering a fixed time window. The
//! authoritative state of every segment lives in the
//! [`SegmentStore`](crate::store::SegmentStore); the values here are
//! snapshots of that state.

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Size of the buffer used when streaming segment bytes into the hasher.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Lifecycle state of a segment.
///
/// Segments move `Active -> Normal -> {Preserved | Evicted}`. `Preserved`
/// is terminal as far as retention is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Still being written by the capture collaborator.
    Active,
    /// Completed and eligible for eviction.
    Normal,
    /// Linked to a crash event and exempt from eviction.
    Preserved,
    /// Removed from disk.
    Evicted,
}

impl SegmentState {
    /// Whether the segment finished capturing (normal or preserved).
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Normal | Self::Preserved)
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Normal => write!(f, "normal"),
            Self::Preserved => write!(f, "preserved"),
            Self::Evicted => write!(f, "evicted"),
        }
    }
}

/// BLAKE3 digest of a segment's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    /// Fingerprint an in-memory byte slice.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes))
    }

    /// Stream a reader into the hasher in bounded chunks.
    ///
    /// Returns the fingerprint and the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised by the reader.
    pub fn from_reader(mut reader: impl Read) -> io::Result<(Self, u64)> {
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((Self(hasher.finalize()), total))
    }

    /// Lowercase hex encoding of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Short prefix for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(16);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = blake3::HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s).map(Self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}

/// Snapshot of a recorded segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Identifier derived from the capture start time. Stable across state
    /// changes.
    pub name: String,

    /// Current location on disk.
    pub path: PathBuf,

    /// Lifecycle state at the time of the snapshot.
    pub state: SegmentState,

    /// Capture start time.
    pub created_at: DateTime<Utc>,

    /// Bytes on disk.
    pub size_bytes: u64,

    /// Content fingerprint, once the integrity ledger has processed it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl Segment {
    /// Whether retention may evict this segment.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.state == SegmentState::Normal
    }

    /// Whether this segment is preserved crash footage.
    #[must_use]
    pub fn is_preserved(&self) -> bool {
        self.state == SegmentState::Preserved
    }
}
