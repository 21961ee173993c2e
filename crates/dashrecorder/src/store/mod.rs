//! Segment store for dashrecorder.
//!
//! The store owns the authoritative state of every segment. It keeps an
//! in-memory index guarded by a single mutex, and uses the filesystem as the
//! durable backing: every transition is one create, rename or delete applied
//! while the index lock is held, so a concurrent `list_segments` never sees a
//! half-applied transition and a restart recovers state from file names.
//!
//! Other components never touch the segment directory directly; they go
//! through this API.

pub mod naming;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::segment::{Fingerprint, Segment, SegmentState};

pub use naming::{ParsedName, SegmentNamer};

/// Advisory lock file held by the process that writes the directory.
pub const LOCK_FILE_NAME: &str = ".dashrecorder.lock";

/// How many disambiguated names to try before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Options for opening a [`SegmentStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Segment file extension (without the dot).
    pub extension: String,
    /// Open as the single writer. Read-only stores take no lock and refuse
    /// every transition.
    pub exclusive: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            extension: "mp4".to_string(),
            exclusive: true,
        }
    }
}

impl StoreOptions {
    /// Options for a read-only view of a directory another process writes.
    #[must_use]
    pub fn read_only(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            exclusive: false,
        }
    }
}

/// An allocated segment that is being captured.
///
/// Returned by [`SegmentStore::begin_segment`] and consumed by
/// [`SegmentStore::complete_segment`] or [`SegmentStore::discard_segment`].
#[derive(Debug)]
pub struct SegmentHandle {
    name: String,
    path: PathBuf,
    created_at: DateTime<Utc>,
}

impl SegmentHandle {
    /// Name of the allocated segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the capture collaborator must write to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capture start time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Statistics about the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Segments still being captured.
    pub active: usize,
    /// Completed segments eligible for eviction.
    pub normal: usize,
    /// Preserved crash segments.
    pub preserved: usize,
    /// Bytes used by all segments.
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    state: SegmentState,
    created_at: DateTime<Utc>,
    size_bytes: u64,
    fingerprint: Option<Fingerprint>,
}

/// The newest segment slot handed out.
#[derive(Debug, Clone)]
struct Allocation {
    name: String,
    created_at: DateTime<Utc>,
}

/// On-disk directory of video segments.
#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
    namer: SegmentNamer,
    exclusive: bool,
    index: Mutex<BTreeMap<String, IndexEntry>>,
    /// Newest slot handed out. New names sort after it, so a name freed by
    /// eviction is not reused. Locked after `index`.
    last_allocated: Mutex<Option<Allocation>>,
    /// Held for the lifetime of a writable store.
    _lock_file: Option<File>,
}

impl SegmentStore {
    /// Open the segment directory and recover segment state from file names.
    ///
    /// In exclusive mode the directory is created if needed, the writer lock
    /// is taken, and `.part` files left by an interrupted capture are
    /// deleted. In read-only mode `.part` files are reported as active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreLocked`] if another process holds the writer
    /// lock, or an I/O error if the directory cannot be read.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let namer = SegmentNamer::new(&options.extension)?;

        let lock_file = if options.exclusive {
            if !dir.exists() {
                fs::create_dir_all(&dir).map_err(|source| Error::DirectoryCreate {
                    path: dir.clone(),
                    source,
                })?;
            }
            Some(Self::acquire_lock(&dir)?)
        } else {
            None
        };

        let index = Self::scan(&dir, &namer, options.exclusive)?;
        info!(
            dir = %dir.display(),
            segments = index.len(),
            exclusive = options.exclusive,
            "Segment store opened"
        );

        let last_allocated = index.iter().next_back().map(|(name, entry)| Allocation {
            name: name.clone(),
            created_at: entry.created_at,
        });

        Ok(Self {
            dir,
            namer,
            exclusive: options.exclusive,
            index: Mutex::new(index),
            last_allocated: Mutex::new(last_allocated),
            _lock_file: lock_file,
        })
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::StoreLocked { path: lock_path });
        }
        Ok(lock_file)
    }

    fn scan(
        dir: &Path,
        namer: &SegmentNamer,
        exclusive: bool,
    ) -> Result<BTreeMap<String, IndexEntry>> {
        let mut index = BTreeMap::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            // Nothing recorded yet
            Err(e) if e.kind() == io::ErrorKind::NotFound && !exclusive => return Ok(index),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(parsed) = namer.parse(file_name) else {
                trace!(file = file_name, "Ignoring non-segment file");
                continue;
            };

            if parsed.state == SegmentState::Active && exclusive {
                warn!(
                    segment = %parsed.name,
                    "Discarding segment left by an interrupted capture"
                );
                remove_if_exists(&entry.path())?;
                continue;
            }

            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let candidate = IndexEntry {
                state: parsed.state,
                created_at: parsed.created_at,
                size_bytes,
                fingerprint: None,
            };

            // The same name as both normal and preserved: preservation wins
            match index.get(&parsed.name).map(|existing| existing.state) {
                Some(SegmentState::Preserved) => {
                    warn!(segment = %parsed.name, "Duplicate segment file, keeping preserved copy");
                }
                Some(_) if parsed.state != SegmentState::Preserved => {
                    warn!(segment = %parsed.name, "Duplicate segment file ignored");
                }
                _ => {
                    index.insert(parsed.name, candidate);
                }
            }
        }

        Ok(index)
    }

    /// The segment directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The naming scheme used by this store.
    #[must_use]
    pub fn namer(&self) -> &SegmentNamer {
        &self.namer
    }

    /// Whether this store may apply transitions.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.exclusive
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.exclusive {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    fn path_for(&self, name: &str, state: SegmentState) -> PathBuf {
        self.dir.join(self.namer.file_name(name, state))
    }

    fn snapshot(&self, name: &str, entry: &IndexEntry) -> Segment {
        Segment {
            name: name.to_string(),
            path: self.path_for(name, entry.state),
            state: entry.state,
            created_at: entry.created_at,
            size_bytes: entry.size_bytes,
            fingerprint: entry.fingerprint,
        }
    }

    /// Allocate a new active segment named after the current time.
    ///
    /// # Errors
    ///
    /// See [`SegmentStore::begin_segment_at`].
    pub fn begin_segment(&self) -> Result<SegmentHandle> {
        self.begin_segment_at(Utc::now())
    }

    /// Allocate a new active segment named after `created_at`.
    ///
    /// The `.part` file is created with create-new semantics. If the derived
    /// name is taken, or was already handed out in this second, a counter is
    /// appended; an existing segment is never overwritten.
    ///
    /// Names only move forward. A `created_at` earlier than the newest slot
    /// (the wall clock was stepped back) is clamped: to the newest slot's
    /// time within the same second, otherwise to the second after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NameCollision`] if no free name was found, or an I/O
    /// error if the file cannot be created.
    pub fn begin_segment_at(&self, created_at: DateTime<Utc>) -> Result<SegmentHandle> {
        self.ensure_writable()?;
        let mut index = self.index.lock();
        let mut last_allocated = self.last_allocated.lock();
        let created_at = self.clamp_to_last(created_at, last_allocated.as_ref());
        let base = self.namer.derive(created_at);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                base.clone()
            } else {
                self.namer.disambiguate(&base, attempt)
            };
            let reused = last_allocated
                .as_ref()
                .is_some_and(|last| name <= last.name);
            if reused || index.contains_key(&name) {
                debug!(segment = %name, "Segment name taken, disambiguating");
                continue;
            }

            let path = self.path_for(&name, SegmentState::Active);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }

            index.insert(
                name.clone(),
                IndexEntry {
                    state: SegmentState::Active,
                    created_at,
                    size_bytes: 0,
                    fingerprint: None,
                },
            );
            *last_allocated = Some(Allocation {
                name: name.clone(),
                created_at,
            });
            debug!(segment = %name, "Segment allocated");
            return Ok(SegmentHandle {
                name,
                path,
                created_at,
            });
        }

        Err(Error::NameCollision { name: base })
    }

    fn clamp_to_last(
        &self,
        created_at: DateTime<Utc>,
        last: Option<&Allocation>,
    ) -> DateTime<Utc> {
        let Some(last) = last else {
            return created_at;
        };
        if created_at >= last.created_at {
            return created_at;
        }
        if self.namer.derive(created_at) == self.namer.derive(last.created_at) {
            return last.created_at;
        }

        warn!(
            requested = %created_at,
            newest = %last.name,
            "Clock is behind the newest segment, naming after it"
        );
        last.created_at + chrono::Duration::seconds(1)
    }

    /// Mark an active segment as completed (`Active -> Normal`).
    ///
    /// A capture that wrote nothing is a failed capture: the slot is removed
    /// and [`Error::WriteIncomplete`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteIncomplete`] when `bytes_written` is zero,
    /// [`Error::InvalidTransition`] if the segment is no longer active, or
    /// an I/O error if the rename fails (the slot is discarded in that case).
    pub fn complete_segment(&self, handle: SegmentHandle, bytes_written: u64) -> Result<Segment> {
        self.ensure_writable()?;
        let mut index = self.index.lock();

        let state = index
            .get(&handle.name)
            .map(|entry| entry.state)
            .ok_or_else(|| Error::segment_not_found(&handle.name))?;
        if state != SegmentState::Active {
            return Err(Error::invalid_transition(
                &handle.name,
                state,
                SegmentState::Normal,
            ));
        }

        if bytes_written == 0 {
            index.remove(&handle.name);
            remove_if_exists(&handle.path)?;
            sync_dir(&self.dir);
            return Err(Error::WriteIncomplete { name: handle.name });
        }

        let final_path = self.path_for(&handle.name, SegmentState::Normal);
        if let Err(e) = fs::rename(&handle.path, &final_path) {
            index.remove(&handle.name);
            let _ = remove_if_exists(&handle.path);
            return Err(e.into());
        }
        sync_dir(&self.dir);

        let Some(entry) = index.get_mut(&handle.name) else {
            return Err(Error::internal("segment vanished while locked"));
        };
        entry.state = SegmentState::Normal;
        entry.size_bytes = bytes_written;
        info!(segment = %handle.name, bytes = bytes_written, "Segment completed");
        Ok(self.snapshot(&handle.name, entry))
    }

    /// Drop an active segment whose capture failed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the partial file cannot be removed.
    pub fn discard_segment(&self, handle: SegmentHandle) -> Result<()> {
        self.ensure_writable()?;
        let mut index = self.index.lock();
        if matches!(
            index.get(&handle.name).map(|e| e.state),
            Some(SegmentState::Active)
        ) {
            index.remove(&handle.name);
        }
        remove_if_exists(&handle.path)?;
        sync_dir(&self.dir);
        debug!(segment = %handle.name, "Segment discarded");
        Ok(())
    }

    /// Consistent snapshot of all segments, oldest first.
    ///
    /// Ordered by `created_at`, ties broken by name.
    #[must_use]
    pub fn list_segments(&self) -> Vec<Segment> {
        let index = self.index.lock();
        let mut segments: Vec<Segment> = index
            .iter()
            .map(|(name, entry)| self.snapshot(name, entry))
            .collect();
        drop(index);

        segments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        segments
    }

    /// Snapshot of one segment.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Segment> {
        let index = self.index.lock();
        index.get(name).map(|entry| self.snapshot(name, entry))
    }

    /// Preserve the newest completed segment.
    ///
    /// If the newest completed segment is already preserved, this is a no-op
    /// that returns it, so repeated crash triggers keep exactly one segment
    /// preserved. Returns `Ok(None)` when no segment has completed yet.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the rename fails.
    pub fn preserve_most_recent_completed(&self) -> Result<Option<Segment>> {
        self.ensure_writable()?;
        let mut index = self.index.lock();

        let newest = index
            .iter()
            .filter(|(_, entry)| entry.state.is_completed())
            .max_by(|(a_name, a), (b_name, b)| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a_name.cmp(b_name))
            })
            .map(|(name, entry)| (name.clone(), entry.state));

        match newest {
            None => Ok(None),
            Some((name, SegmentState::Preserved)) => {
                trace!(segment = %name, "Newest segment already preserved");
                Ok(index.get(&name).map(|entry| self.snapshot(&name, entry)))
            }
            Some((name, _)) => self.mark_preserved(&mut index, &name).map(Some),
        }
    }

    /// Preserve a specific segment.
    ///
    /// Preserving an already-preserved segment is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentNotFound`] for an unknown name or
    /// [`Error::InvalidTransition`] for a segment still being captured.
    pub fn preserve(&self, name: &str) -> Result<Segment> {
        self.ensure_writable()?;
        let mut index = self.index.lock();
        let state = index
            .get(name)
            .map(|entry| entry.state)
            .ok_or_else(|| Error::segment_not_found(name))?;

        match state {
            SegmentState::Normal => self.mark_preserved(&mut index, name),
            SegmentState::Preserved => index
                .get(name)
                .map(|entry| self.snapshot(name, entry))
                .ok_or_else(|| Error::segment_not_found(name)),
            other => Err(Error::invalid_transition(name, other, SegmentState::Preserved)),
        }
    }

    fn mark_preserved(
        &self,
        index: &mut BTreeMap<String, IndexEntry>,
        name: &str,
    ) -> Result<Segment> {
        let from = self.path_for(name, SegmentState::Normal);
        let to = self.path_for(name, SegmentState::Preserved);
        fs::rename(&from, &to)?;
        sync_dir(&self.dir);

        let entry = index
            .get_mut(name)
            .ok_or_else(|| Error::segment_not_found(name))?;
        entry.state = SegmentState::Preserved;
        info!(segment = %name, "Segment preserved");
        Ok(self.snapshot(name, entry))
    }

    /// Evict a normal segment (`Normal -> Evicted`) and delete its bytes.
    ///
    /// The state is checked under the index lock immediately before the
    /// delete, so a segment preserved since the caller's scan is refused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the segment is not normal; an
    /// unknown name is reported as already evicted. Callers treat this as a
    /// benign race and skip the segment.
    pub fn evict(&self, name: &str) -> Result<Segment> {
        self.ensure_writable()?;
        let mut index = self.index.lock();

        let state = index
            .get(name)
            .map_or(SegmentState::Evicted, |entry| entry.state);
        if state != SegmentState::Normal {
            return Err(Error::invalid_transition(name, state, SegmentState::Evicted));
        }

        let path = self.path_for(name, SegmentState::Normal);
        remove_if_exists(&path)?;
        sync_dir(&self.dir);

        let entry = index
            .remove(name)
            .ok_or_else(|| Error::segment_not_found(name))?;
        Ok(Segment {
            name: name.to_string(),
            path,
            state: SegmentState::Evicted,
            created_at: entry.created_at,
            size_bytes: entry.size_bytes,
            fingerprint: entry.fingerprint,
        })
    }

    /// Remove a completed segment, preserved or not.
    ///
    /// This is the explicit operator action; retention never calls it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentNotFound`] for an unknown name or
    /// [`Error::InvalidTransition`] for a segment still being captured.
    pub fn purge(&self, name: &str) -> Result<Segment> {
        self.ensure_writable()?;
        let mut index = self.index.lock();
        let state = index
            .get(name)
            .map(|entry| entry.state)
            .ok_or_else(|| Error::segment_not_found(name))?;
        if !state.is_completed() {
            return Err(Error::invalid_transition(name, state, SegmentState::Evicted));
        }

        let path = self.path_for(name, state);
        remove_if_exists(&path)?;
        sync_dir(&self.dir);

        let entry = index
            .remove(name)
            .ok_or_else(|| Error::segment_not_found(name))?;
        warn!(segment = %name, from = %state, "Segment purged by operator");
        Ok(Segment {
            name: name.to_string(),
            path,
            state: SegmentState::Evicted,
            created_at: entry.created_at,
            size_bytes: entry.size_bytes,
            fingerprint: entry.fingerprint,
        })
    }

    /// Open a segment's bytes for reading.
    ///
    /// The file is opened while the index lock is held, so a concurrent
    /// preserve (rename) cannot invalidate the path between lookup and open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentNotFound`] if the store has no such segment
    /// or its file has disappeared.
    pub fn open_segment(&self, name: &str) -> Result<(File, Segment)> {
        let index = self.index.lock();
        let entry = index
            .get(name)
            .ok_or_else(|| Error::segment_not_found(name))?;
        let segment = self.snapshot(name, entry);
        match File::open(&segment.path) {
            Ok(file) => Ok((file, segment)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::segment_not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the fingerprint computed for a segment.
    ///
    /// Returns `false` if the store no longer has the segment.
    pub fn attach_fingerprint(&self, name: &str, fingerprint: Fingerprint) -> bool {
        let mut index = self.index.lock();
        match index.get_mut(name) {
            Some(entry) => {
                entry.fingerprint = Some(fingerprint);
                true
            }
            None => false,
        }
    }

    /// Total bytes used by all segments.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.lock().values().map(|e| e.size_bytes).sum()
    }

    /// Segment counts per state and bytes used.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let index = self.index.lock();
        let mut stats = StoreStats::default();
        for entry in index.values() {
            match entry.state {
                SegmentState::Active => stats.active += 1,
                SegmentState::Normal => stats.normal += 1,
                SegmentState::Preserved => stats.preserved += 1,
                SegmentState::Evicted => {}
            }
            stats.total_bytes += entry.size_bytes;
        }
        stats
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Flush directory metadata so a rename or delete survives a power cut.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "Failed to sync segment directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
