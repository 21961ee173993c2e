//! Integrity ledger for recorded segments.
//!
//! Every completed segment is fingerprinted and the fingerprint is stored in
//! a small JSON file next to the videos:
//!
//! ```json
//! {
//!   "20261016_143000": { "hash": "<blake3 hex>", "timestamp": "2026-10-16T14:31:00Z" }
//! }
//! ```
//!
//! The file is rewritten (temp file, fsync, rename) after every change. An
//! unreadable file on startup is moved aside and the ledger starts empty;
//! segments recorded before that point verify as [`Verification::NoRecord`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::segment::{Fingerprint, Segment};
use crate::store::SegmentStore;

/// Default ledger file name inside the segment directory.
pub const LEDGER_FILE_NAME: &str = "video_hashes.json";

/// Fingerprint record for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Digest of the segment bytes.
    #[serde(rename = "hash")]
    pub fingerprint: Fingerprint,

    /// When the digest was computed.
    #[serde(rename = "timestamp")]
    pub computed_at: DateTime<Utc>,
}

/// Outcome of checking a segment against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The bytes on disk match the recorded fingerprint.
    Verified,
    /// The bytes on disk changed since they were fingerprinted.
    Tampered {
        /// Fingerprint stored in the ledger.
        expected: Fingerprint,
        /// Fingerprint of the current bytes.
        actual: Fingerprint,
    },
    /// The ledger has no entry for the segment.
    NoRecord,
    /// The ledger has an entry but the segment is gone.
    FileMissing,
}

impl Verification {
    /// Whether the segment passed verification.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    /// Short label for display.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Tampered { .. } => "tampered",
            Self::NoRecord => "no_record",
            Self::FileMissing => "file_missing",
        }
    }
}

impl std::fmt::Display for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Persistent mapping from segment name to fingerprint.
#[derive(Debug)]
pub struct IntegrityLedger {
    path: PathBuf,
    store: Arc<SegmentStore>,
    entries: Mutex<BTreeMap<String, LedgerEntry>>,
}

impl IntegrityLedger {
    /// Load the ledger at `path` and attach known fingerprints to `store`.
    ///
    /// A missing file yields an empty ledger. A corrupt or unreadable file
    /// also yields an empty ledger; when the store is writable the bad file
    /// is renamed to `<path>.corrupt` so it is not silently overwritten.
    #[must_use]
    pub fn open(path: impl AsRef<Path>, store: Arc<SegmentStore>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = Self::load(&path, store.is_writable());

        for (name, entry) in &entries {
            store.attach_fingerprint(name, entry.fingerprint);
        }
        debug!(path = %path.display(), entries = entries.len(), "Integrity ledger loaded");

        Self {
            path,
            store,
            entries: Mutex::new(entries),
        }
    }

    fn load(path: &Path, writable: bool) -> BTreeMap<String, LedgerEntry> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ledger unreadable, starting empty");
                return BTreeMap::new();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ledger corrupt, starting empty");
                if writable {
                    let aside = corrupt_path(path);
                    if let Err(e) = fs::rename(path, &aside) {
                        warn!(error = %e, "Failed to move corrupt ledger aside");
                    } else {
                        info!(path = %aside.display(), "Corrupt ledger moved aside");
                    }
                }
                BTreeMap::new()
            }
        }
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the ledger has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The entry recorded for a segment.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<LedgerEntry> {
        self.entries.lock().get(name).copied()
    }

    /// Fingerprint a segment's current bytes and record the result.
    ///
    /// The bytes are streamed in bounded chunks. Any previous entry for the
    /// segment is replaced, so fingerprinting again after a retry is safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentNotFound`] if the segment is gone, or an I/O
    /// error if reading the segment or writing the ledger fails.
    pub fn fingerprint_and_record(&self, segment: &Segment) -> Result<LedgerEntry> {
        let (file, _) = self.store.open_segment(&segment.name)?;
        let (fingerprint, bytes) = Fingerprint::from_reader(io::BufReader::new(file))?;
        let entry = LedgerEntry {
            fingerprint,
            computed_at: Utc::now(),
        };

        {
            let mut entries = self.entries.lock();
            entries.insert(segment.name.clone(), entry);
            self.persist(&entries)?;
        }
        self.store.attach_fingerprint(&segment.name, fingerprint);

        debug!(
            segment = %segment.name,
            fingerprint = %fingerprint.short(),
            bytes,
            "Segment fingerprinted"
        );
        Ok(entry)
    }

    /// Check a segment's current bytes against its recorded fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the segment exists but cannot be read.
    pub fn verify(&self, name: &str) -> Result<Verification> {
        let Some(entry) = self.get(name) else {
            return Ok(Verification::NoRecord);
        };

        let file = match self.store.open_segment(name) {
            Ok((file, _)) => file,
            Err(Error::SegmentNotFound { .. }) => return Ok(Verification::FileMissing),
            Err(e) => return Err(e),
        };

        let (actual, _) = Fingerprint::from_reader(io::BufReader::new(file))?;
        if actual == entry.fingerprint {
            Ok(Verification::Verified)
        } else {
            warn!(
                segment = %name,
                expected = %entry.fingerprint.short(),
                actual = %actual.short(),
                "Segment fingerprint mismatch"
            );
            Ok(Verification::Tampered {
                expected: entry.fingerprint,
                actual,
            })
        }
    }

    /// Verify every completed segment and every ledger entry.
    ///
    /// Results are ordered by segment name.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error hit while reading a segment.
    pub fn verify_all(&self) -> Result<Vec<(String, Verification)>> {
        let mut names: BTreeSet<String> = self
            .store
            .list_segments()
            .into_iter()
            .filter(|segment| segment.state.is_completed())
            .map(|segment| segment.name)
            .collect();
        names.extend(self.entries.lock().keys().cloned());

        names
            .into_iter()
            .map(|name| {
                let outcome = self.verify(&name)?;
                Ok((name, outcome))
            })
            .collect()
    }

    /// Drop the entry for an evicted segment.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the ledger cannot be written.
    pub fn remove(&self, name: &str) -> Result<Option<LedgerEntry>> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(name);
        if removed.is_some() {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    /// Write the ledger atomically. Called with the entries lock held so
    /// writers are serialized.
    fn persist(&self, entries: &BTreeMap<String, LedgerEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let tmp = temp_path(&self.path);
        let payload = serde_json::to_vec_pretty(entries)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use chrono::Duration;
    use tempfile::TempDir;

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-16T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn setup() -> (TempDir, Arc<SegmentStore>, IntegrityLedger) {
        crate::logging::init_test_logging();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SegmentStore::open(dir.path(), StoreOptions::default()).unwrap());
        let ledger = IntegrityLedger::open(dir.path().join(LEDGER_FILE_NAME), Arc::clone(&store));
        (dir, store, ledger)
    }

    fn record(store: &SegmentStore, offset_secs: i64, bytes: &[u8]) -> Segment {
        let handle = store
            .begin_segment_at(base_time() + Duration::seconds(offset_secs))
            .unwrap();
        fs::write(handle.path(), bytes).unwrap();
        store.complete_segment(handle, bytes.len() as u64).unwrap()
    }

    #[test]
    fn test_unchanged_segment_verifies() {
        let (_dir, store, ledger) = setup();
        let segment = record(&store, 0, b"abc");

        let entry = ledger.fingerprint_and_record(&segment).unwrap();
        assert_eq!(entry.fingerprint, Fingerprint::of_bytes(b"abc"));
        assert_eq!(ledger.verify(&segment.name).unwrap(), Verification::Verified);
        assert_eq!(
            store.get(&segment.name).unwrap().fingerprint,
            Some(entry.fingerprint)
        );
    }

    #[test]
    fn test_rewritten_segment_is_tampered() {
        let (_dir, store, ledger) = setup();
        let segment = record(&store, 0, b"abc");
        ledger.fingerprint_and_record(&segment).unwrap();

        fs::write(&segment.path, b"abd").unwrap();

        match ledger.verify(&segment.name).unwrap() {
            Verification::Tampered { expected, actual } => {
                assert_eq!(expected, Fingerprint::of_bytes(b"abc"));
                assert_eq!(actual, Fingerprint::of_bytes(b"abd"));
            }
            other => panic!("expected tampered, got {other}"),
        }
    }

    #[test]
    fn test_unknown_segment_has_no_record() {
        let (_dir, store, ledger) = setup();
        let segment = record(&store, 0, b"abc");
        assert_eq!(ledger.verify(&segment.name).unwrap(), Verification::NoRecord);
        assert_eq!(ledger.verify("19990101_000000").unwrap(), Verification::NoRecord);
    }

    #[test]
    fn test_evicted_segment_is_file_missing() {
        let (_dir, store, ledger) = setup();
        let segment = record(&store, 0, b"abc");
        ledger.fingerprint_and_record(&segment).unwrap();
        store.evict(&segment.name).unwrap();

        assert_eq!(
            ledger.verify(&segment.name).unwrap(),
            Verification::FileMissing
        );
    }

    #[test]
    fn test_preserved_segment_still_verifies() {
        let (_dir, store, ledger) = setup();
        let segment = record(&store, 0, b"crash footage");
        ledger.fingerprint_and_record(&segment).unwrap();
        store.preserve(&segment.name).unwrap();

        assert!(ledger.verify(&segment.name).unwrap().is_verified());
    }

    #[test]
    fn test_refingerprint_overwrites_entry() {
        let (_dir, store, ledger) = setup();
        let segment = record(&store, 0, b"abc");
        ledger.fingerprint_and_record(&segment).unwrap();

        fs::write(&segment.path, b"abcdef").unwrap();
        let entry = ledger.fingerprint_and_record(&segment).unwrap();

        assert_eq!(entry.fingerprint, Fingerprint::of_bytes(b"abcdef"));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.verify(&segment.name).unwrap().is_verified());
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILE_NAME);
        let name = {
            let store =
                Arc::new(SegmentStore::open(dir.path(), StoreOptions::default()).unwrap());
            let ledger = IntegrityLedger::open(&ledger_path, Arc::clone(&store));
            let segment = record(&store, 0, b"abc");
            ledger.fingerprint_and_record(&segment).unwrap();
            segment.name
        };

        let store = Arc::new(SegmentStore::open(dir.path(), StoreOptions::default()).unwrap());
        let ledger = IntegrityLedger::open(&ledger_path, Arc::clone(&store));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.verify(&name).unwrap().is_verified());
        assert!(store.get(&name).unwrap().fingerprint.is_some());
    }

    #[test]
    fn test_ledger_file_shape() {
        let (dir, store, ledger) = setup();
        let segment = record(&store, 0, b"abc");
        ledger.fingerprint_and_record(&segment).unwrap();

        let raw = fs::read_to_string(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = &json[&segment.name];
        assert_eq!(
            record["hash"].as_str().unwrap(),
            Fingerprint::of_bytes(b"abc").to_hex()
        );
        assert!(record["timestamp"].is_string());
        assert!(!dir.path().join("video_hashes.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_ledger_starts_empty_and_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILE_NAME);
        fs::write(&ledger_path, b"{ not json").unwrap();

        let store = Arc::new(SegmentStore::open(dir.path(), StoreOptions::default()).unwrap());
        let ledger = IntegrityLedger::open(&ledger_path, Arc::clone(&store));

        assert!(ledger.is_empty());
        assert!(!ledger_path.exists());
        assert_eq!(
            fs::read(dir.path().join("video_hashes.json.corrupt")).unwrap(),
            b"{ not json"
        );

        // Recording carries on against the fresh ledger
        let segment = record(&store, 0, b"abc");
        ledger.fingerprint_and_record(&segment).unwrap();
        assert!(ledger.verify(&segment.name).unwrap().is_verified());
    }

    #[test]
    fn test_corrupt_ledger_left_alone_by_read_only_view() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILE_NAME);
        fs::write(&ledger_path, b"[1, 2").unwrap();

        let view =
            Arc::new(SegmentStore::open(dir.path(), StoreOptions::read_only("mp4")).unwrap());
        let ledger = IntegrityLedger::open(&ledger_path, view);

        assert!(ledger.is_empty());
        assert!(ledger_path.exists());
    }

    #[test]
    fn test_remove_drops_entry() {
        let (_dir, store, ledger) = setup();
        let segment = record(&store, 0, b"abc");
        ledger.fingerprint_and_record(&segment).unwrap();

        assert!(ledger.remove(&segment.name).unwrap().is_some());
        assert!(ledger.remove(&segment.name).unwrap().is_none());
        assert!(ledger.get(&segment.name).is_none());
    }

    #[test]
    fn test_verify_all_covers_store_and_ledger() {
        let (_dir, store, ledger) = setup();
        let kept = record(&store, 0, b"kept");
        let gone = record(&store, 60, b"gone");
        let unhashed = record(&store, 120, b"new");
        ledger.fingerprint_and_record(&kept).unwrap();
        ledger.fingerprint_and_record(&gone).unwrap();
        store.evict(&gone.name).unwrap();

        let results = ledger.verify_all().unwrap();
        assert_eq!(
            results,
            vec![
                (kept.name, Verification::Verified),
                (gone.name, Verification::FileMissing),
                (unhashed.name, Verification::NoRecord),
            ]
        );
    }

    #[test]
    fn test_verification_labels() {
        assert_eq!(Verification::Verified.to_string(), "verified");
        assert_eq!(Verification::NoRecord.to_string(), "no_record");
        assert_eq!(Verification::FileMissing.to_string(), "file_missing");
        let fp = Fingerprint::of_bytes(b"x");
        assert_eq!(
            Verification::Tampered {
                expected: fp,
                actual: fp
            }
            .label(),
            "tampered"
        );
    }
}
