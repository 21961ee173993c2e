//! On-disk naming scheme for segment files.
//!
//! ```text
//! 20261016_143000.mp4          normal
//! 20261016_143000_01.mp4       normal, disambiguated after a name collision
//! CRASH_20261016_142900.mp4    preserved
//! 20261016_143100.mp4.part     active (capture in progress)
//! ```
//!
//! The segment name is the part without the state markers, so it stays
//! the same when a segment is preserved. Any other file in the directory
//! (GPS log, ledger, lock file) does not match and is ignored.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::error::{Error, Result};
use crate::segment::SegmentState;

/// File name prefix marking preserved crash footage.
pub const PRESERVED_PREFIX: &str = "CRASH_";

/// File name suffix marking a segment still being captured.
pub const ACTIVE_SUFFIX: &str = ".part";

/// `chrono` format of the time-derived part of a segment name.
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A segment file name broken into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Segment name without state markers.
    pub name: String,
    /// State encoded by the file name.
    pub state: SegmentState,
    /// Capture start time encoded in the name (second resolution).
    pub created_at: DateTime<Utc>,
}

/// Derives, formats and recognizes segment file names.
#[derive(Debug, Clone)]
pub struct SegmentNamer {
    extension: String,
    pattern: Regex,
}

impl SegmentNamer {
    /// Create a namer for segment files with the given extension.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the extension is empty or not ASCII
    /// alphanumeric.
    pub fn new(extension: &str) -> Result<Self> {
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::ConfigValidation {
                message: format!("invalid segment extension: {extension:?}"),
            });
        }

        let pattern = format!(
            concat!(
                r"^(?P<crash>{prefix})?",
                r"(?P<name>(?P<stamp>\d{{8}}_\d{{6}})(?:_\d{{2,}})?)",
                r"\.{ext}(?P<part>{suffix})?$",
            ),
            prefix = regex::escape(PRESERVED_PREFIX),
            ext = regex::escape(extension),
            suffix = regex::escape(ACTIVE_SUFFIX),
        );
        let pattern = Regex::new(&pattern)
            .map_err(|e| Error::internal(format!("segment name pattern: {e}")))?;

        Ok(Self {
            extension: extension.to_string(),
            pattern,
        })
    }

    /// The segment file extension.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Derive the base name for a segment starting at `created_at`.
    #[must_use]
    pub fn derive(&self, created_at: DateTime<Utc>) -> String {
        created_at.format(STAMP_FORMAT).to_string()
    }

    /// Append a collision counter to a base name.
    ///
    /// The counter is zero-padded so disambiguated names sort after the base
    /// name and before the next second.
    #[must_use]
    pub fn disambiguate(&self, base: &str, attempt: u32) -> String {
        format!("{base}_{attempt:02}")
    }

    /// File name for a segment in the given state.
    ///
    /// Evicted segments have no file; their last (normal) name is returned.
    #[must_use]
    pub fn file_name(&self, name: &str, state: SegmentState) -> String {
        match state {
            SegmentState::Active => format!("{name}.{}{ACTIVE_SUFFIX}", self.extension),
            SegmentState::Normal | SegmentState::Evicted => format!("{name}.{}", self.extension),
            SegmentState::Preserved => format!("{PRESERVED_PREFIX}{name}.{}", self.extension),
        }
    }

    /// Recognize a segment file name.
    ///
    /// Returns `None` for anything that is not a segment file.
    #[must_use]
    pub fn parse(&self, file_name: &str) -> Option<ParsedName> {
        let caps = self.pattern.captures(file_name)?;
        let crash = caps.name("crash").is_some();
        let part = caps.name("part").is_some();

        let state = match (crash, part) {
            (false, false) => SegmentState::Normal,
            (true, false) => SegmentState::Preserved,
            (false, true) => SegmentState::Active,
            // A preserved segment is never captured into
            (true, true) => return None,
        };

        let naive = NaiveDateTime::parse_from_str(&caps["stamp"], STAMP_FORMAT).ok()?;

        Some(ParsedName {
            name: caps["name"].to_string(),
            state,
            created_at: Utc.from_utc_datetime(&naive),
        })
    }
}
