//! Cache driver keeping entry statistics in an embedded SQLite database
//!
//! The default variant and the fallback when the xattr driver cannot be
//! configured, since it needs nothing from the filesystem beyond plain
//! files. Blob bytes live in the shared directory layout; hit counts and
//! access times live in `cache.db` inside the base directory, which is
//! excluded from size and enumeration scans.

use crate::config::CacheConfig;
use crate::drivers::{
    active_size, delete_all_queue_markers, delete_cache_file, delete_queue_marker, open_active,
    queue_marker, queued_entries, reap_old_files, regular_files, BlobWriter, CacheDriver,
    CachePaths,
};
use crate::error::{CacheError, Result};
use crate::types::CacheEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const DB_NAME: &str = "cache.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cached_blobs (
    blob_id       TEXT PRIMARY KEY,
    size          INTEGER NOT NULL,
    hits          INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER NOT NULL,
    last_modified INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS invalid_blobs (
    blob_id        TEXT PRIMARY KEY,
    error          TEXT NOT NULL,
    invalidated_at INTEGER NOT NULL
);
";

/// Timestamps are stored as microseconds since the epoch so that two
/// commits in the same second still order deterministically.
fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

/// The SQLite database and its sidecar files share the base directory with
/// Active entries and must never be treated as cached blobs.
fn is_db_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(DB_NAME))
        .unwrap_or(false)
}

/// File-based driver variant with per-entry statistics in SQLite.
pub struct SqliteDriver {
    paths: CachePaths,
    stall_time: Duration,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDriver {
    /// Build and configure the driver: create the state directories, open
    /// (or create) the statistics database and apply the schema.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let paths = CachePaths::new(&config.dir);
        paths.create_dirs()?;

        let db_path = paths.base.join(DB_NAME);
        let conn = Connection::open(&db_path).map_err(|e| {
            CacheError::Config(format!(
                "failed to open cache statistics database {}: {}",
                db_path.display(),
                e
            ))
        })?;
        conn.execute_batch(SCHEMA).map_err(|e| {
            CacheError::Config(format!(
                "failed to initialize cache statistics schema: {}",
                e
            ))
        })?;

        Ok(Self {
            paths,
            stall_time: config.stall_time(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Metadata("statistics database lock poisoned".to_string()))
    }

    /// Regular files in the base directory, minus the database files.
    async fn active_files(&self) -> Result<Vec<std::path::PathBuf>> {
        Ok(regular_files(&self.paths.base)
            .await?
            .into_iter()
            .filter(|path| !is_db_file(path))
            .collect())
    }
}

struct SqliteWriter {
    blob_id: String,
    paths: CachePaths,
    conn: Arc<Mutex<Connection>>,
    file: Option<File>,
    bytes_written: u64,
    finished: bool,
}

#[async_trait]
impl BlobWriter for SqliteWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(chunk).await?;
                self.bytes_written += chunk.len() as u64;
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
        let final_path = self.paths.active(&self.blob_id);
        debug!(
            blob_id = %self.blob_id,
            from = %incomplete.display(),
            to = %final_path.display(),
            "fetch finished, moving cache entry into place"
        );
        tokio::fs::rename(&incomplete, &final_path).await?;
        self.finished = true;

        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| CacheError::Metadata("statistics database lock poisoned".to_string()))?;
            let now = now_micros();
            conn.execute(
                "INSERT OR REPLACE INTO cached_blobs \
                 (blob_id, size, hits, last_accessed, last_modified) \
                 VALUES (?1, ?2, 0, ?3, ?3)",
                params![self.blob_id, self.bytes_written as i64, now],
            )?;
        }

        // Pop the blob from the prefetch queue now that it is cached.
        delete_queue_marker(&self.paths, &self.blob_id).await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>, error: &str) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        let incomplete = self.paths.incomplete_entry(&self.blob_id);
        debug!(
            blob_id = %self.blob_id,
            error,
            "fetch of cache entry failed, rolling back to invalid"
        );
        tokio::fs::rename(&incomplete, self.paths.invalid_entry(&self.blob_id)).await?;
        self.finished = true;

        let conn = self
            .conn
            .lock()
            .map_err(|_| CacheError::Metadata("statistics database lock poisoned".to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO invalid_blobs (blob_id, error, invalidated_at) \
             VALUES (?1, ?2, ?3)",
            params![self.blob_id, error, now_micros()],
        )?;
        Ok(())
    }
}

impl Drop for SqliteWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandoned before commit or rollback: treat as invalid.
        drop(self.file.take());
        let incomplete = self.paths.incomplete_entry(&self.blob_id);
        if incomplete.exists() {
            if let Err(e) = std::fs::rename(&incomplete, self.paths.invalid_entry(&self.blob_id)) {
                warn!(
                    blob_id = %self.blob_id,
                    error = %e,
                    "failed to move abandoned entry to invalid"
                );
                return;
            }
            if let Ok(conn) = self.conn.lock() {
                let _ = conn.execute(
                    "INSERT OR REPLACE INTO invalid_blobs (blob_id, error, invalidated_at) \
                     VALUES (?1, 'incomplete fetch', ?2)",
                    params![self.blob_id, now_micros()],
                );
            }
        }
    }
}

#[async_trait]
impl CacheDriver for SqliteDriver {
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
        Ok(Box::new(SqliteWriter {
            blob_id: blob_id.to_string(),
            paths: self.paths.clone(),
            conn: Arc::clone(&self.conn),
            file: Some(file),
            bytes_written: 0,
            finished: false,
        }))
    }

    async fn open_for_read(&self, blob_id: &str) -> Result<File> {
        open_active(&self.paths, blob_id).await
    }

    async fn record_hit(&self, blob_id: &str) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE cached_blobs SET hits = hits + 1, last_accessed = ?1 WHERE blob_id = ?2",
            params![now_micros(), blob_id],
        )?;
        if updated == 0 {
            return Err(CacheError::NotCached(blob_id.to_string()));
        }
        Ok(())
    }

    async fn hit_count(&self, blob_id: &str) -> Result<u64> {
        let hits: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT hits FROM cached_blobs WHERE blob_id = ?1",
                params![blob_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hits.unwrap_or(0).max(0) as u64)
    }

    async fn cache_size(&self) -> Result<u64> {
        let mut total = 0;
        for path in self.active_files().await? {
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
        let rows: Vec<(String, i64, i64, i64, i64)> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT blob_id, size, hits, last_accessed, last_modified \
                 FROM cached_blobs ORDER BY blob_id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (blob_id, size, hits, last_accessed, last_modified) in rows {
            // Row for a file deleted behind our back: drop it and move on.
            if !self.is_cached(&blob_id).await {
                self.conn()?.execute(
                    "DELETE FROM cached_blobs WHERE blob_id = ?1",
                    params![blob_id],
                )?;
                continue;
            }
            entries.push(CacheEntry {
                blob_id,
                size: size.max(0) as u64,
                hits: hits.max(0) as u64,
                last_accessed: micros_to_datetime(last_accessed),
                last_modified: micros_to_datetime(last_modified),
            });
        }
        Ok(entries)
    }

    async fn least_recently_accessed(&self) -> Result<Option<(String, u64)>> {
        loop {
            let oldest: Option<(String, i64)> = self
                .conn()?
                .query_row(
                    "SELECT blob_id, size FROM cached_blobs \
                     ORDER BY last_accessed ASC, blob_id ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (blob_id, size) = match oldest {
                Some(row) => row,
                None => return Ok(None),
            };

            if self.is_cached(&blob_id).await {
                return Ok(Some((blob_id, size.max(0) as u64)));
            }
            // Stale row, self-heal and rescan.
            self.conn()?.execute(
                "DELETE FROM cached_blobs WHERE blob_id = ?1",
                params![blob_id],
            )?;
        }
    }

    async fn delete_cached_blob(&self, blob_id: &str) -> Result<()> {
        delete_cache_file(&self.paths.active(blob_id)).await;
        self.conn()?.execute(
            "DELETE FROM cached_blobs WHERE blob_id = ?1",
            params![blob_id],
        )?;
        Ok(())
    }

    async fn delete_all_cached_blobs(&self) -> Result<u64> {
        let mut deleted = 0;
        for path in self.active_files().await? {
            delete_cache_file(&path).await;
            deleted += 1;
        }
        self.conn()?.execute("DELETE FROM cached_blobs", [])?;
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
        {
            let conn = self.conn()?;
            for blob_id in &reaped {
                conn.execute(
                    "DELETE FROM invalid_blobs WHERE blob_id = ?1",
                    params![blob_id],
                )?;
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_driver(dir: &Path) -> SqliteDriver {
        SqliteDriver::new(&CacheConfig::new(dir)).unwrap()
    }

    async fn cache_blob(driver: &SqliteDriver, blob_id: &str, content: &[u8]) {
        let mut writer = driver.open_for_write(blob_id).await.unwrap();
        writer.write_chunk(content).await.unwrap();
        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_makes_blob_active() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        assert!(driver.is_cacheable("blob1").await);
        cache_blob(&driver, "blob1", b"hello world").await;

        assert!(driver.is_cached("blob1").await);
        assert!(!driver.is_being_cached("blob1").await);
        assert!(!driver.is_cacheable("blob1").await);
        assert_eq!(driver.blob_size("blob1").await.unwrap(), 11);
        assert_eq!(driver.hit_count("blob1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cache_size_excludes_database() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        assert_eq!(driver.cache_size().await.unwrap(), 0);
        cache_blob(&driver, "a", &[0u8; 60]).await;
        cache_blob(&driver, "b", &[0u8; 50]).await;
        assert_eq!(driver.cache_size().await.unwrap(), 110);
    }

    #[tokio::test]
    async fn test_rollback_records_error_row() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        let mut writer = driver.open_for_write("bad").await.unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        writer.rollback("checksum mismatch").await.unwrap();

        assert!(!driver.is_cached("bad").await);
        assert!(dir.path().join("invalid").join("bad").exists());

        let error: String = driver
            .conn()
            .unwrap()
            .query_row(
                "SELECT error FROM invalid_blobs WHERE blob_id = 'bad'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(error, "checksum mismatch");
    }

    #[tokio::test]
    async fn test_abandoned_writer_moves_to_invalid() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        let mut writer = driver.open_for_write("ghost").await.unwrap();
        writer.write_chunk(b"never finished").await.unwrap();
        drop(writer);

        assert!(!driver.is_being_cached("ghost").await);
        assert!(dir.path().join("invalid").join("ghost").exists());
    }

    #[tokio::test]
    async fn test_record_hit_and_lru_order() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        cache_blob(&driver, "a", &[0u8; 10]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache_blob(&driver, "b", &[0u8; 20]).await;

        // "a" committed first, so it is least recently accessed
        assert_eq!(
            driver.least_recently_accessed().await.unwrap(),
            Some(("a".to_string(), 10))
        );

        // Reading "a" makes "b" the eviction candidate
        driver.record_hit("a").await.unwrap();
        assert_eq!(
            driver.least_recently_accessed().await.unwrap(),
            Some(("b".to_string(), 20))
        );
        assert_eq!(driver.hit_count("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_hit_on_absent_blob() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());
        match driver.record_hit("missing").await {
            Err(CacheError::NotCached(blob_id)) => assert_eq!(blob_id, "missing"),
            other => panic!("expected NotCached, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cached_blobs_sorted_and_self_healing() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        cache_blob(&driver, "zebra", b"zz").await;
        cache_blob(&driver, "alpha", b"aa").await;

        let entries = driver.cached_blobs().await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.blob_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zebra"]);

        // A file removed behind the driver's back disappears from listings
        tokio::fs::remove_file(dir.path().join("zebra")).await.unwrap();
        let entries = driver.cached_blobs().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].blob_id, "alpha");
    }

    #[tokio::test]
    async fn test_delete_all_cached_blobs() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        cache_blob(&driver, "a", b"1").await;
        cache_blob(&driver, "b", b"2").await;

        assert_eq!(driver.delete_all_cached_blobs().await.unwrap(), 2);
        assert_eq!(driver.cache_size().await.unwrap(), 0);
        assert!(!driver.is_cached("a").await);
        assert_eq!(driver.cached_blobs().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_reap_invalid_clears_rows() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        let writer = driver.open_for_write("bad").await.unwrap();
        writer.rollback("boom").await.unwrap();

        assert_eq!(driver.reap_invalid(None).await.unwrap(), 1);
        let remaining: i64 = driver
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM invalid_blobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
