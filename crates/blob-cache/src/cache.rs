//! LRU cache facade for blob data
//!
//! [`BlobCache`] owns exactly one configured driver and layers the
//! streaming tee/verify path plus the prune and clean policies on top of
//! the driver primitives. Caching is best-effort and delivery is
//! guaranteed: no cache failure of any kind may cause a blob download to
//! fail, truncate or change content.

use crate::config::CacheConfig;
use crate::drivers::{BlobWriter, CacheDriver, SqliteDriver, XattrDriver};
use crate::error::{CacheError, Result};
use crate::types::{CacheEntry, DriverKind};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, info, warn};

/// Chunk size used when streaming a local file through the tee path.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Blob content as consumed and produced by the cache: a finite,
/// single-pass sequence of opaque byte chunks.
pub type ChunkStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Scoped read of an Active entry.
///
/// Reads delegate to the underlying cache file; calling
/// [`ReadGuard::finish`] after a successful full read bumps the blob's hit
/// count. Dropping the guard without finishing counts as an incomplete
/// read and leaves the count untouched.
pub struct ReadGuard<'a> {
    file: File,
    blob_id: String,
    driver: &'a dyn CacheDriver,
}

impl ReadGuard<'_> {
    /// Report a successful full read, incrementing the blob's hit count.
    pub async fn finish(self) -> Result<()> {
        self.driver.record_hit(&self.blob_id).await
    }
}

impl AsyncRead for ReadGuard<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.file).poll_read(cx, buf)
    }
}

/// Node-local LRU cache for blob data.
pub struct BlobCache {
    driver: Box<dyn CacheDriver>,
    max_size: u64,
}

/// Startup-time registry mapping a driver name to its constructor.
fn build_driver(kind: DriverKind, config: &CacheConfig) -> Result<Box<dyn CacheDriver>> {
    match kind {
        DriverKind::Xattr => Ok(Box::new(XattrDriver::new(config)?)),
        DriverKind::Sqlite => Ok(Box::new(SqliteDriver::new(config)?)),
    }
}

fn init_driver(config: &CacheConfig) -> Result<Box<dyn CacheDriver>> {
    match build_driver(config.driver, config) {
        Ok(driver) => {
            info!(driver = %config.driver, "blob cache configured driver");
            Ok(driver)
        }
        Err(CacheError::Config(reason)) if config.driver != DriverKind::Sqlite => {
            warn!(
                driver = %config.driver,
                reason,
                "cache driver failed to configure, defaulting to sqlite"
            );
            build_driver(DriverKind::Sqlite, config)
        }
        Err(e) => Err(e),
    }
}

impl BlobCache {
    /// Configure the cache with the selected driver variant, falling back
    /// to the sqlite variant when the selected one fails to configure.
    /// Errors only when the fallback fails too, in which case the process
    /// should fail fast.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let driver = init_driver(&config)?;
        Ok(Self {
            driver,
            max_size: config.max_size,
        })
    }

    pub async fn is_cached(&self, blob_id: &str) -> bool {
        self.driver.is_cached(blob_id).await
    }

    pub async fn is_queued(&self, blob_id: &str) -> bool {
        self.driver.is_queued(blob_id).await
    }

    /// Total size in bytes of all Active entries.
    pub async fn cache_size(&self) -> Result<u64> {
        self.driver.cache_size().await
    }

    pub async fn blob_size(&self, blob_id: &str) -> Result<u64> {
        self.driver.blob_size(blob_id).await
    }

    pub async fn hit_count(&self, blob_id: &str) -> Result<u64> {
        self.driver.hit_count(blob_id).await
    }

    /// Records for all Active entries, sorted by blob id.
    pub async fn cached_blobs(&self) -> Result<Vec<CacheEntry>> {
        self.driver.cached_blobs().await
    }

    pub async fn delete_cached_blob(&self, blob_id: &str) -> Result<()> {
        self.driver.delete_cached_blob(blob_id).await
    }

    pub async fn delete_all_cached_blobs(&self) -> Result<u64> {
        self.driver.delete_all_cached_blobs().await
    }

    pub async fn delete_queued_blob(&self, blob_id: &str) -> Result<()> {
        self.driver.delete_queued_blob(blob_id).await
    }

    pub async fn delete_all_queued_blobs(&self) -> Result<u64> {
        self.driver.delete_all_queued_blobs().await
    }

    /// Queue a blob for out-of-band prefetch. Idempotent: false without
    /// effect when the blob is already cached, being cached or queued.
    pub async fn queue_blob(&self, blob_id: &str) -> Result<bool> {
        self.driver.queue_blob(blob_id).await
    }

    /// Queued blob ids in the order they were enqueued.
    pub async fn queued_blobs(&self) -> Result<Vec<String>> {
        self.driver.queued_blobs().await
    }

    /// Open an Active entry for reading.
    pub async fn open_for_read(&self, blob_id: &str) -> Result<ReadGuard<'_>> {
        let file = self.driver.open_for_read(blob_id).await?;
        Ok(ReadGuard {
            file,
            blob_id: blob_id.to_string(),
            driver: self.driver.as_ref(),
        })
    }

    /// A stream that tees the blob's content into the cache while the
    /// consumer reads it. When the blob is not cacheable the source is
    /// returned unchanged and no caching is attempted.
    pub async fn caching_stream(
        &self,
        blob_id: &str,
        checksum: Option<&str>,
        source: ChunkStream,
    ) -> ChunkStream {
        if !self.driver.is_cacheable(blob_id).await {
            return source;
        }

        debug!(blob_id, "tee'ing blob into cache");
        match self.driver.open_for_write(blob_id).await {
            Ok(writer) => cache_tee_stream(
                blob_id.to_string(),
                checksum.map(str::to_string),
                writer,
                source,
            ),
            Err(e) => {
                // Fail open: serve the content without caching it.
                warn!(
                    blob_id,
                    error = %e,
                    "failed to open cache entry for write, continuing with response"
                );
                source
            }
        }
    }

    /// Cache a blob by draining its content stream.
    ///
    /// Returns false immediately, without consuming `source`, when the
    /// blob is not cacheable. Otherwise drains the tee to completion and
    /// returns true whether or not caching itself succeeded; afterwards
    /// the blob is either cached or its failed write sits in `invalid/`.
    /// Only a source stream error is propagated.
    pub async fn cache_blob_stream(
        &self,
        blob_id: &str,
        source: ChunkStream,
        checksum: Option<&str>,
    ) -> Result<bool> {
        if !self.driver.is_cacheable(blob_id).await {
            return Ok(false);
        }

        let mut stream = self.caching_stream(blob_id, checksum, source).await;
        while let Some(chunk) = stream.next().await {
            chunk?;
        }
        Ok(true)
    }

    /// Cache a blob whose content already exists as a local file.
    ///
    /// The file is streamed through the same tee path as a download, so
    /// the cacheability check, verification and commit rules are
    /// identical to [`BlobCache::cache_blob_stream`].
    pub async fn cache_blob_file(
        &self,
        blob_id: &str,
        path: impl AsRef<Path>,
        checksum: Option<&str>,
    ) -> Result<bool> {
        if !self.driver.is_cacheable(blob_id).await {
            return Ok(false);
        }
        let file = File::open(path.as_ref()).await?;
        self.cache_blob_stream(blob_id, file_chunks(file), checksum)
            .await
    }

    /// Evict least-recently-accessed entries until the cache fits its
    /// size budget. Returns how many entries and bytes were freed; a
    /// second call with no intervening writes is a no-op returning (0, 0).
    pub async fn prune(&self) -> Result<(u64, u64)> {
        let mut current_size = self.driver.cache_size().await?;
        if current_size <= self.max_size {
            debug!("blob cache has free space, skipping prune");
            return Ok((0, 0));
        }

        debug!(
            overage = current_size - self.max_size,
            max_size = self.max_size,
            "blob cache over max size, starting prune"
        );

        let mut files_pruned = 0u64;
        let mut bytes_pruned = 0u64;
        while current_size > self.max_size {
            let (blob_id, size) = match self.driver.least_recently_accessed().await? {
                Some(entry) => entry,
                None => break,
            };
            debug!(blob_id = %blob_id, size, "pruning cache entry");
            self.driver.delete_cached_blob(&blob_id).await?;
            files_pruned += 1;
            bytes_pruned += size;
            current_size = current_size.saturating_sub(size);
        }

        info!(files_pruned, bytes_pruned, "prune finished");
        Ok((files_pruned, bytes_pruned))
    }

    /// Remove all Invalid entries immediately and Incomplete entries older
    /// than `stall_time` (configured default when `None`). Returns the
    /// number of entries reaped.
    pub async fn clean(&self, stall_time: Option<Duration>) -> Result<u64> {
        self.driver.clean(stall_time).await
    }
}

/// A local file as a chunk stream.
fn file_chunks(file: File) -> ChunkStream {
    futures::stream::unfold(Some(file), |file| async move {
        let mut file = file?;
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

struct TeeState {
    blob_id: String,
    expected: Option<String>,
    source: ChunkStream,
    writer: Option<Box<dyn BlobWriter>>,
    hasher: Sha256,
}

/// The tee-and-verify streaming path.
///
/// Per chunk: write into the cache entry, fold into the running digest,
/// then yield the chunk onward, in that order. A write failure rolls the
/// entry back and the stream keeps forwarding the remaining source chunks
/// untouched. After the source is exhausted the entry is committed, or
/// rolled back when the digest does not match the expected checksum; the
/// mismatch is recorded on the invalid entry and never reaches the
/// consumer, who by then has already received all content.
fn cache_tee_stream(
    blob_id: String,
    expected: Option<String>,
    writer: Box<dyn BlobWriter>,
    source: ChunkStream,
) -> ChunkStream {
    let state = TeeState {
        blob_id,
        expected,
        source,
        writer: Some(writer),
        hasher: Sha256::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        match state.source.next().await {
            Some(Ok(chunk)) => {
                if let Some(mut writer) = state.writer.take() {
                    match writer.write_chunk(&chunk).await {
                        Ok(()) => {
                            state.hasher.update(&chunk);
                            state.writer = Some(writer);
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            warn!(
                                blob_id = %state.blob_id,
                                error = %e,
                                "exception while tee'ing blob into cache, continuing with response"
                            );
                            if let Err(e) = writer.rollback(&reason).await {
                                warn!(
                                    blob_id = %state.blob_id,
                                    error = %e,
                                    "rollback of failed cache write also failed"
                                );
                            }
                        }
                    }
                }
                Some((Ok(chunk), state))
            }
            Some(Err(e)) => {
                // The source went bad; the partial entry can never verify.
                if let Some(writer) = state.writer.take() {
                    if let Err(e) = writer.rollback("source stream error").await {
                        warn!(
                            blob_id = %state.blob_id,
                            error = %e,
                            "rollback after source stream error failed"
                        );
                    }
                }
                Some((Err(e), state))
            }
            None => {
                if let Some(writer) = state.writer.take() {
                    let actual = hex::encode(std::mem::take(&mut state.hasher).finalize());
                    match state.expected.as_deref() {
                        Some(expected) if expected != actual => {
                            let err = CacheError::ChecksumMismatch {
                                blob_id: state.blob_id.clone(),
                                expected: expected.to_string(),
                                actual,
                            };
                            warn!(blob_id = %state.blob_id, error = %err, "aborting caching of blob");
                            if let Err(e) = writer.rollback(&err.to_string()).await {
                                warn!(
                                    blob_id = %state.blob_id,
                                    error = %e,
                                    "rollback after checksum mismatch failed"
                                );
                            }
                        }
                        _ => {
                            if let Err(e) = writer.commit().await {
                                warn!(
                                    blob_id = %state.blob_id,
                                    error = %e,
                                    "failed to commit cached blob"
                                );
                            }
                        }
                    }
                }
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn new_cache(dir: &Path, max_size: u64) -> BlobCache {
        let mut config = CacheConfig::new(dir);
        config.max_size = max_size;
        BlobCache::new(config).unwrap()
    }

    fn chunks(parts: &[&[u8]]) -> ChunkStream {
        let owned: Vec<std::io::Result<Bytes>> = parts
            .iter()
            .map(|part| Ok(Bytes::copy_from_slice(part)))
            .collect();
        futures::stream::iter(owned).boxed()
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    async fn read_cached(cache: &BlobCache, blob_id: &str) -> Vec<u8> {
        let mut guard = cache.open_for_read(blob_id).await.unwrap();
        let mut content = Vec::new();
        guard.read_to_end(&mut content).await.unwrap();
        guard.finish().await.unwrap();
        content
    }

    #[tokio::test]
    async fn test_cache_and_read_round_trip() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        let checksum = sha256_hex(b"hello world");
        let cached = cache
            .cache_blob_stream("blob1", chunks(&[b"hello ", b"world"]), Some(&checksum))
            .await
            .unwrap();
        assert!(cached);

        assert!(cache.is_cached("blob1").await);
        assert_eq!(cache.blob_size("blob1").await.unwrap(), 11);
        assert_eq!(read_cached(&cache, "blob1").await, b"hello world");
    }

    #[tokio::test]
    async fn test_uncacheable_blob_leaves_source_unconsumed() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        cache
            .cache_blob_stream("blob1", chunks(&[b"content"]), None)
            .await
            .unwrap();

        let untouched: ChunkStream =
            futures::stream::poll_fn(|_| panic!("source must not be polled")).boxed();
        let cached = cache
            .cache_blob_stream("blob1", untouched, None)
            .await
            .unwrap();
        assert!(!cached);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_open() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        let stream = cache
            .caching_stream("blob1", Some("0000bad0000"), chunks(&[b"first", b"second"]))
            .await;
        let received: Vec<Bytes> = stream.map(|chunk| chunk.unwrap()).collect().await;

        // The consumer got the complete, unmodified content
        let all: Vec<u8> = received.concat();
        assert_eq!(all, b"firstsecond");

        // ... but the blob was not cached, its write went to invalid/
        assert!(!cache.is_cached("blob1").await);
        assert!(dir.path().join("invalid").join("blob1").exists());
    }

    #[tokio::test]
    async fn test_caching_stream_passes_through_when_cached() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        cache
            .cache_blob_stream("blob1", chunks(&[b"data"]), None)
            .await
            .unwrap();

        // Already cached: the tee must not touch the entry again
        let stream = cache
            .caching_stream("blob1", None, chunks(&[b"other"]))
            .await;
        let received: Vec<Bytes> = stream.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(received.concat(), b"other");
        assert_eq!(read_cached(&cache, "blob1").await, b"data");
    }

    #[tokio::test]
    async fn test_source_error_rolls_back_and_propagates() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        let source: ChunkStream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"good chunk")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "backend hung up",
            )),
        ])
        .boxed();

        let result = cache.cache_blob_stream("blob1", source, None).await;
        assert!(matches!(result, Err(CacheError::Io(_))));
        assert!(!cache.is_cached("blob1").await);
        assert!(dir.path().join("invalid").join("blob1").exists());
    }

    #[tokio::test]
    async fn test_cache_blob_file() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        let staging = tempdir().unwrap();
        let source = staging.path().join("upload.bin");
        tokio::fs::write(&source, b"file payload").await.unwrap();

        let checksum = sha256_hex(b"file payload");
        assert!(cache
            .cache_blob_file("from-file", &source, Some(&checksum))
            .await
            .unwrap());
        assert!(cache.is_cached("from-file").await);
        assert_eq!(read_cached(&cache, "from-file").await, b"file payload");

        // Already cached: refused without touching the entry
        assert!(!cache
            .cache_blob_file("from-file", &source, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_prune_evicts_least_recently_accessed() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 100);

        cache
            .cache_blob_stream("a", chunks(&[&[0u8; 60]]), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache
            .cache_blob_stream("b", chunks(&[&[0u8; 50]]), None)
            .await
            .unwrap();

        assert_eq!(cache.cache_size().await.unwrap(), 110);

        let (files, bytes) = cache.prune().await.unwrap();
        assert_eq!((files, bytes), (1, 60));
        assert!(!cache.is_cached("a").await);
        assert!(cache.is_cached("b").await);
        assert_eq!(cache.cache_size().await.unwrap(), 50);

        // Idempotent: nothing more to evict
        assert_eq!(cache.prune().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_prune_noop_under_budget() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        cache
            .cache_blob_stream("a", chunks(&[b"small"]), None)
            .await
            .unwrap();
        assert_eq!(cache.prune().await.unwrap(), (0, 0));
        assert!(cache.is_cached("a").await);
    }

    #[tokio::test]
    async fn test_queue_idempotent_and_fifo() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        assert!(cache.queue_blob("x").await.unwrap());
        assert!(!cache.queue_blob("x").await.unwrap());
        assert_eq!(cache.queued_blobs().await.unwrap(), vec!["x"]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.queue_blob("y").await.unwrap());
        assert_eq!(cache.queued_blobs().await.unwrap(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_caching_queued_blob_pops_marker() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        cache.queue_blob("x").await.unwrap();
        cache
            .cache_blob_stream("x", chunks(&[b"content"]), None)
            .await
            .unwrap();

        assert!(cache.is_cached("x").await);
        assert!(!cache.is_queued("x").await);
        assert!(cache.queued_blobs().await.unwrap().is_empty());

        // Re-queueing a cached blob is refused
        assert!(!cache.queue_blob("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_hit_count_increments_per_full_read() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        cache
            .cache_blob_stream("counted", chunks(&[b"data"]), None)
            .await
            .unwrap();
        assert_eq!(cache.hit_count("counted").await.unwrap(), 0);

        for _ in 0..3 {
            read_cached(&cache, "counted").await;
        }
        assert_eq!(cache.hit_count("counted").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_clean_reaps_stalled_and_invalid() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        // A stalled incomplete entry, e.g. a download that hung
        tokio::fs::write(dir.path().join("incomplete").join("y"), b"partial")
            .await
            .unwrap();
        // An invalid entry from a failed write
        cache
            .caching_stream("bad", Some("not-the-digest"), chunks(&[b"junk"]))
            .await
            .map(|chunk| chunk.unwrap())
            .collect::<Vec<Bytes>>()
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = cache.clean(Some(Duration::from_millis(1))).await.unwrap();
        assert_eq!(reaped, 2);
        assert!(!dir.path().join("incomplete").join("y").exists());
        assert!(!dir.path().join("invalid").join("bad").exists());

        // Second pass is a no-op
        assert_eq!(cache.clean(Some(Duration::from_millis(1))).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cached_blobs_listing() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        cache
            .cache_blob_stream("zebra", chunks(&[b"zz"]), None)
            .await
            .unwrap();
        cache
            .cache_blob_stream("alpha", chunks(&[b"aaaa"]), None)
            .await
            .unwrap();

        let entries = cache.cached_blobs().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].blob_id, "alpha");
        assert_eq!(entries[0].size, 4);
        assert_eq!(entries[1].blob_id, "zebra");
        assert_eq!(entries[1].size, 2);
    }

    #[tokio::test]
    async fn test_delete_all_counts() {
        let dir = tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);

        cache
            .cache_blob_stream("a", chunks(&[b"1"]), None)
            .await
            .unwrap();
        cache
            .cache_blob_stream("b", chunks(&[b"2"]), None)
            .await
            .unwrap();
        cache.queue_blob("q1").await.unwrap();
        cache.queue_blob("q2").await.unwrap();

        assert_eq!(cache.delete_all_cached_blobs().await.unwrap(), 2);
        assert_eq!(cache.delete_all_queued_blobs().await.unwrap(), 2);
        assert_eq!(cache.cache_size().await.unwrap(), 0);
        assert!(cache.queued_blobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_succeeds_for_either_driver_kind() {
        // The facade must always end up with some working driver: the
        // xattr variant where the filesystem supports it, the sqlite
        // fallback otherwise.
        for kind in [DriverKind::Xattr, DriverKind::Sqlite] {
            let dir = tempdir().unwrap();
            let mut config = CacheConfig::new(dir.path());
            config.driver = kind;
            let cache = BlobCache::new(config).unwrap();

            cache
                .cache_blob_stream("blob", chunks(&[b"payload"]), None)
                .await
                .unwrap();
            assert!(cache.is_cached("blob").await);
            assert_eq!(read_cached(&cache, "blob").await, b"payload");
        }
    }
}
