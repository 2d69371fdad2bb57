//! Cache driver contract and the shared on-disk layout
//!
//! A driver is the storage engine behind the cache facade. Both variants
//! keep blob bytes in the same directory layout and differ only in where
//! per-entry statistics live:
//!
//! ```text
//! $cache_dir/
//!   <blob_id>      Active entries, served to readers
//!   incomplete/    staging area for writes in progress
//!   invalid/       failed or abandoned writes, kept for diagnosis
//!   queue/         zero-length prefetch markers, FIFO by mtime
//! ```
//!
//! A successful write is committed by an atomic rename from `incomplete/`
//! into the base directory, so readers never observe a partially-written
//! Active entry.

pub mod sqlite;
pub mod xattr;

pub use sqlite::SqliteDriver;
pub use xattr::XattrDriver;

use crate::error::{CacheError, Result};
use crate::types::CacheEntry;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::File;
use tracing::{debug, warn};

/// Scoped two-phase write into the cache.
///
/// A writer starts life as an Incomplete entry. `commit` promotes it to
/// Active; `rollback` moves it to Invalid with the error recorded. Dropping
/// a writer without doing either (an abandoned fetch) behaves like a
/// rollback, so a half-written file never lingers in `incomplete/`.
#[async_trait]
pub trait BlobWriter: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Promote the entry to Active: initialize its hit count to zero,
    /// atomically rename it into the base directory and pop any queue
    /// marker for the same blob.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Move the entry to Invalid, recording `error` for diagnosis.
    async fn rollback(self: Box<Self>, error: &str) -> Result<()>;
}

/// The polymorphic storage engine contract.
///
/// Existence checks are point-in-time: `is_cacheable` races with a
/// concurrent `open_for_write` by design. Two concurrent writes of the same
/// blob are both allowed; whichever rename lands last wins and the loser's
/// work is wasted, never corrupting the Active entry.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    /// True if an Active entry exists for the blob.
    async fn is_cached(&self, blob_id: &str) -> bool;

    /// True if a write for the blob is currently in progress.
    async fn is_being_cached(&self, blob_id: &str) -> bool;

    /// True if a prefetch marker exists for the blob.
    async fn is_queued(&self, blob_id: &str) -> bool;

    /// True iff the blob is neither cached nor being cached.
    async fn is_cacheable(&self, blob_id: &str) -> bool {
        !(self.is_cached(blob_id).await || self.is_being_cached(blob_id).await)
    }

    /// Open a write target in the Incomplete state.
    async fn open_for_write(&self, blob_id: &str) -> Result<Box<dyn BlobWriter>>;

    /// Open the Active entry for reading. The caller reports a completed
    /// read through [`CacheDriver::record_hit`].
    async fn open_for_read(&self, blob_id: &str) -> Result<File>;

    /// Bump the hit count after a successful full read. Unlocked
    /// read-modify-write; the count is informational only.
    async fn record_hit(&self, blob_id: &str) -> Result<()>;

    /// Hit count for a blob, 0 when not cached.
    async fn hit_count(&self, blob_id: &str) -> Result<u64>;

    /// Total size in bytes of all Active entries.
    async fn cache_size(&self) -> Result<u64>;

    /// Size in bytes of one Active entry.
    async fn blob_size(&self, blob_id: &str) -> Result<u64>;

    /// Records for all Active entries, sorted by blob id.
    async fn cached_blobs(&self) -> Result<Vec<CacheEntry>>;

    /// Blob id and size of the Active entry with the oldest access time,
    /// or `None` when the cache is empty. Scans all entries per call.
    async fn least_recently_accessed(&self) -> Result<Option<(String, u64)>>;

    async fn delete_cached_blob(&self, blob_id: &str) -> Result<()>;

    /// Delete every Active entry, returning how many were removed.
    async fn delete_all_cached_blobs(&self) -> Result<u64>;

    /// Create a prefetch marker for the blob. Returns false without effect
    /// when the blob is already cached, being cached or queued.
    async fn queue_blob(&self, blob_id: &str) -> Result<bool>;

    /// Queued blob ids in FIFO order (by marker mtime).
    async fn queued_blobs(&self) -> Result<Vec<String>>;

    async fn delete_queued_blob(&self, blob_id: &str) -> Result<()>;

    async fn delete_all_queued_blobs(&self) -> Result<u64>;

    /// Remove Invalid entries older than `grace`, or all of them when
    /// `grace` is `None`.
    async fn reap_invalid(&self, grace: Option<Duration>) -> Result<u64>;

    /// Remove Incomplete entries older than `grace`, or all of them when
    /// `grace` is `None`.
    async fn reap_stalled(&self, grace: Option<Duration>) -> Result<u64>;

    /// The configured grace period for stalled Incomplete entries.
    fn stall_time(&self) -> Duration;

    /// Reap all Invalid entries immediately plus Incomplete entries older
    /// than `stall_time` (configured default when `None`). Returns the
    /// number of entries removed.
    async fn clean(&self, stall_time: Option<Duration>) -> Result<u64> {
        let invalid = self.reap_invalid(None).await?;
        let stalled = self
            .reap_stalled(Some(stall_time.unwrap_or_else(|| self.stall_time())))
            .await?;
        Ok(invalid + stalled)
    }
}

/// The four state directories of the shared layout.
#[derive(Debug, Clone)]
pub(crate) struct CachePaths {
    pub base: PathBuf,
    pub incomplete: PathBuf,
    pub invalid: PathBuf,
    pub queue: PathBuf,
}

impl CachePaths {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            incomplete: base.join("incomplete"),
            invalid: base.join("invalid"),
            queue: base.join("queue"),
        }
    }

    /// Create the base directory and the state subdirectories if absent.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.base, &self.incomplete, &self.invalid, &self.queue] {
            std::fs::create_dir_all(dir).map_err(|e| {
                CacheError::Config(format!(
                    "failed to create cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    pub fn active(&self, blob_id: &str) -> PathBuf {
        self.base.join(blob_id)
    }

    pub fn incomplete_entry(&self, blob_id: &str) -> PathBuf {
        self.incomplete.join(blob_id)
    }

    pub fn invalid_entry(&self, blob_id: &str) -> PathBuf {
        self.invalid.join(blob_id)
    }

    pub fn queue_entry(&self, blob_id: &str) -> PathBuf {
        self.queue.join(blob_id)
    }
}

/// The entry name (blob id) of a path, skipping non-UTF-8 names.
pub(crate) fn entry_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

/// Regular files directly under `dir`. Best-effort snapshot: entries that
/// vanish mid-scan are skipped, not errors.
pub(crate) async fn regular_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        match entry.metadata().await {
            Ok(meta) if meta.is_file() => files.push(entry.path()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(files)
}

/// Open the Active entry for `blob_id`, mapping a missing file to
/// [`CacheError::NotCached`].
pub(crate) async fn open_active(paths: &CachePaths, blob_id: &str) -> Result<File> {
    File::open(paths.active(blob_id)).await.map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            CacheError::NotCached(blob_id.to_string())
        } else {
            e.into()
        }
    })
}

/// Size of the Active entry for `blob_id`.
pub(crate) async fn active_size(paths: &CachePaths, blob_id: &str) -> Result<u64> {
    match tokio::fs::metadata(paths.active(blob_id)).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::NotCached(blob_id.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Create a zero-length prefetch marker unless the blob is already cached,
/// being cached or queued.
pub(crate) async fn queue_marker(paths: &CachePaths, blob_id: &str) -> Result<bool> {
    if tokio::fs::try_exists(paths.active(blob_id)).await? {
        debug!(blob_id, "not queueing blob, already cached");
        return Ok(false);
    }
    if tokio::fs::try_exists(paths.incomplete_entry(blob_id)).await? {
        debug!(blob_id, "not queueing blob, already being written to cache");
        return Ok(false);
    }
    if tokio::fs::try_exists(paths.queue_entry(blob_id)).await? {
        debug!(blob_id, "not queueing blob, already queued");
        return Ok(false);
    }

    debug!(blob_id, "queueing blob for prefetch");
    File::create(paths.queue_entry(blob_id)).await?;
    Ok(true)
}

/// Queued blob ids, FIFO by marker mtime.
pub(crate) async fn queued_entries(paths: &CachePaths) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for path in regular_files(&paths.queue).await? {
        let mtime = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(blob_id) = entry_name(&path) {
            items.push((mtime, blob_id));
        }
    }
    items.sort();
    Ok(items.into_iter().map(|(_, blob_id)| blob_id).collect())
}

/// Remove one queue marker; absent markers are a no-op.
pub(crate) async fn delete_queue_marker(paths: &CachePaths, blob_id: &str) -> Result<()> {
    match tokio::fs::remove_file(paths.queue_entry(blob_id)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove every queue marker, returning the count.
pub(crate) async fn delete_all_queue_markers(paths: &CachePaths) -> Result<u64> {
    let mut deleted = 0;
    for path in regular_files(&paths.queue).await? {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// Delete one cache file, warning (not failing) when it is already gone.
pub(crate) async fn delete_cache_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "deleted blob cache file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "cached blob file doesn't exist, unable to delete");
        }
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete blob cache file"),
    }
}

/// Reap regular files under `dir` older than `grace` (all of them when
/// `grace` is `None`). Returns the reaped entry names.
pub(crate) async fn reap_old_files(dir: &Path, grace: Option<Duration>) -> Result<Vec<String>> {
    let now = SystemTime::now();
    let mut reaped = Vec::new();
    for path in regular_files(dir).await? {
        let mtime = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let age = now.duration_since(mtime).unwrap_or_default();
        let expired = match grace {
            None => {
                debug!(path = %path.display(), "no grace period, reaping immediately");
                true
            }
            Some(grace) => age > grace,
        };
        if expired {
            delete_cache_file(&path).await;
            if let Some(blob_id) = entry_name(&path) {
                reaped.push(blob_id);
            }
        }
    }
    Ok(reaped)
}
