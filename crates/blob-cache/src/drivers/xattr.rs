//! Cache driver keeping entry statistics in extended file attributes
//!
//! Assumes the cache directory lives on a filesystem that supports user
//! extended attributes and updates atime on reads (`noatime` must not be
//! set); access times drive the LRU eviction order. Configuration smoke
//! tests the first assumption and fails with a configuration error when it
//! does not hold, at which point the facade falls back to the sqlite
//! variant.

use crate::config::CacheConfig;
use crate::drivers::{
    active_size, delete_all_queue_markers, delete_cache_file, delete_queue_marker, entry_name,
    open_active, queue_marker, queued_entries, reap_old_files, regular_files, BlobWriter,
    CacheDriver, CachePaths,
};
use crate::error::{CacheError, Result};
use crate::types::CacheEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Attribute keys are namespaced to stay clear of unrelated user xattrs.
const HITS_ATTR: &str = "user.blobcache.hits";
const ERROR_ATTR: &str = "user.blobcache.error";

/// File-based driver variant storing hit counts and error annotations as
/// extended attributes on the cached files themselves.
pub struct XattrDriver {
    paths: CachePaths,
    stall_time: Duration,
}

impl XattrDriver {
    /// Build and configure the driver: create the state directories and
    /// verify the filesystem actually supports user extended attributes.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let paths = CachePaths::new(&config.dir);
        paths.create_dirs()?;
        smoke_test_xattr(&paths.base)?;
        Ok(Self {
            paths,
            stall_time: config.stall_time(),
        })
    }
}

/// Write a user xattr to a throwaway file to confirm the filesystem
/// supports them at all.
fn smoke_test_xattr(base: &Path) -> Result<()> {
    let probe = base.join(".xattr_probe");
    std::fs::write(&probe, b"XXX").map_err(|e| {
        CacheError::Config(format!(
            "cache directory {} is not writable: {}",
            base.display(),
            e
        ))
    })?;
    let outcome = xattr::set(&probe, HITS_ATTR, b"1");
    let _ = std::fs::remove_file(&probe);
    outcome.map_err(|e| {
        CacheError::Config(format!(
            "the device housing the cache directory {} does not support user \
             extended attributes (is the filesystem mounted with user_xattr?): {}",
            base.display(),
            e
        ))
    })
}

fn get_attr(path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
    xattr::get(path, key).map_err(|e| {
        CacheError::Metadata(format!("failed to read {} on {}: {}", key, path.display(), e))
    })
}

fn set_attr(path: &Path, key: &str, value: &[u8]) -> Result<()> {
    xattr::set(path, key, value).map_err(|e| {
        CacheError::Metadata(format!("failed to set {} on {}: {}", key, path.display(), e))
    })
}

fn read_hits(path: &Path) -> Result<u64> {
    match get_attr(path, HITS_ATTR)? {
        Some(raw) => String::from_utf8_lossy(&raw).trim().parse::<u64>().map_err(|_| {
            CacheError::Metadata(format!("malformed hit count on {}", path.display()))
        }),
        None => Ok(0),
    }
}

struct XattrWriter {
    blob_id: String,
    paths: CachePaths,
    file: Option<File>,
    finished: bool,
}

#[async_trait]
impl BlobWriter for XattrWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(chunk).await?;
                Ok(())
            }
            None => Err(CacheError::Metadata(format!(
                "write to already finished cache entry '{}'",
                self.blob_id
            ))),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let incomplete = self.paths.incomplete_entry(&self.blob_id);
        set_attr(&incomplete, HITS_ATTR, b"0")?;

        let final_path = self.paths.active(&self.blob_id);
        debug!(
            blob_id = %self.blob_id,
            from = %incomplete.display(),
            to = %final_path.display(),
            "fetch finished, moving cache entry into place"
        );
        tokio::fs::rename(&incomplete, &final_path).await?;
        self.finished = true;

        // Pop the blob from the prefetch queue now that it is cached.
        delete_queue_marker(&self.paths, &self.blob_id).await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>, error: &str) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        let incomplete = self.paths.incomplete_entry(&self.blob_id);
        if let Err(e) = set_attr(&incomplete, ERROR_ATTR, error.as_bytes()) {
            warn!(blob_id = %self.blob_id, error = %e, "failed to record error on invalid entry");
        }
        debug!(
            blob_id = %self.blob_id,
            error,
            "fetch of cache entry failed, rolling back to invalid"
        );
        tokio::fs::rename(&incomplete, self.paths.invalid_entry(&self.blob_id)).await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for XattrWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Neither commit nor rollback ran: the consumer abandoned the fetch
        // mid-stream. The partial file is unusable, treat it as invalid.
        drop(self.file.take());
        let incomplete = self.paths.incomplete_entry(&self.blob_id);
        if incomplete.exists() {
            if let Err(e) = set_attr(&incomplete, ERROR_ATTR, b"incomplete fetch") {
                warn!(blob_id = %self.blob_id, error = %e, "failed to tag abandoned entry");
            }
            if let Err(e) = std::fs::rename(&incomplete, self.paths.invalid_entry(&self.blob_id)) {
                warn!(
                    blob_id = %self.blob_id,
                    error = %e,
                    "failed to move abandoned entry to invalid"
                );
            }
        }
    }
}

#[async_trait]
impl CacheDriver for XattrDriver {
    async fn is_cached(&self, blob_id: &str) -> bool {
        tokio::fs::try_exists(self.paths.active(blob_id))
            .await
            .unwrap_or(false)
    }

    async fn is_being_cached(&self, blob_id: &str) -> bool {
        tokio::fs::try_exists(self.paths.incomplete_entry(blob_id))
            .await
            .unwrap_or(false)
    }

    async fn is_queued(&self, blob_id: &str) -> bool {
        tokio::fs::try_exists(self.paths.queue_entry(blob_id))
            .await
            .unwrap_or(false)
    }

    async fn open_for_write(&self, blob_id: &str) -> Result<Box<dyn BlobWriter>> {
        let file = File::create(self.paths.incomplete_entry(blob_id)).await?;
        Ok(Box::new(XattrWriter {
            blob_id: blob_id.to_string(),
            paths: self.paths.clone(),
            file: Some(file),
            finished: false,
        }))
    }

    async fn open_for_read(&self, blob_id: &str) -> Result<File> {
        open_active(&self.paths, blob_id).await
    }

    async fn record_hit(&self, blob_id: &str) -> Result<()> {
        let path = self.paths.active(blob_id);
        if !self.is_cached(blob_id).await {
            return Err(CacheError::NotCached(blob_id.to_string()));
        }
        // get, add one, set: racy but the count is informational only
        let hits = read_hits(&path)?;
        set_attr(&path, HITS_ATTR, (hits + 1).to_string().as_bytes())
    }

    async fn hit_count(&self, blob_id: &str) -> Result<u64> {
        if !self.is_cached(blob_id).await {
            return Ok(0);
        }
        read_hits(&self.paths.active(blob_id))
    }

    async fn cache_size(&self) -> Result<u64> {
        let mut total = 0;
        for path in regular_files(&self.paths.base).await? {
            match tokio::fs::metadata(&path).await {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    async fn blob_size(&self, blob_id: &str) -> Result<u64> {
        active_size(&self.paths, blob_id).await
    }

    async fn cached_blobs(&self) -> Result<Vec<CacheEntry>> {
        debug!("gathering cached blob entries");
        let mut entries = Vec::new();
        for path in regular_files(&self.paths.base).await? {
            let blob_id = match entry_name(&path) {
                Some(blob_id) => blob_id,
                None => continue,
            };
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let modified = meta.modified()?;
            let accessed = meta.accessed().unwrap_or(modified);
            entries.push(CacheEntry {
                hits: read_hits(&path)?,
                blob_id,
                size: meta.len(),
                last_modified: DateTime::<Utc>::from(modified),
                last_accessed: DateTime::<Utc>::from(accessed),
            });
        }
        entries.sort_by(|a, b| a.blob_id.cmp(&b.blob_id));
        Ok(entries)
    }

    async fn least_recently_accessed(&self) -> Result<Option<(String, u64)>> {
        let mut stats: Vec<(SystemTime, u64, String)> = Vec::new();
        for path in regular_files(&self.paths.base).await? {
            let blob_id = match entry_name(&path) {
                Some(blob_id) => blob_id,
                None => continue,
            };
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let accessed = meta.accessed().or_else(|_| meta.modified())?;
            stats.push((accessed, meta.len(), blob_id));
        }
        Ok(stats
            .into_iter()
            .min_by(|a, b| (a.0, &a.2).cmp(&(b.0, &b.2)))
            .map(|(_, size, blob_id)| (blob_id, size)))
    }

    async fn delete_cached_blob(&self, blob_id: &str) -> Result<()> {
        delete_cache_file(&self.paths.active(blob_id)).await;
        Ok(())
    }

    async fn delete_all_cached_blobs(&self) -> Result<u64> {
        let mut deleted = 0;
        for path in regular_files(&self.paths.base).await? {
            delete_cache_file(&path).await;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn queue_blob(&self, blob_id: &str) -> Result<bool> {
        queue_marker(&self.paths, blob_id).await
    }

    async fn queued_blobs(&self) -> Result<Vec<String>> {
        queued_entries(&self.paths).await
    }

    async fn delete_queued_blob(&self, blob_id: &str) -> Result<()> {
        delete_queue_marker(&self.paths, blob_id).await
    }

    async fn delete_all_queued_blobs(&self) -> Result<u64> {
        delete_all_queue_markers(&self.paths).await
    }

    async fn reap_invalid(&self, grace: Option<Duration>) -> Result<u64> {
        let reaped = reap_old_files(&self.paths.invalid, grace).await?;
        info!(reaped = reaped.len(), "reaped invalid cache entries");
        Ok(reaped.len() as u64)
    }

    async fn reap_stalled(&self, grace: Option<Duration>) -> Result<u64> {
        let reaped = reap_old_files(&self.paths.incomplete, grace).await?;
        info!(reaped = reaped.len(), "reaped stalled cache entries");
        Ok(reaped.len() as u64)
    }

    fn stall_time(&self) -> Duration {
        self.stall_time
    }
}
