//! Cache configuration
//!
//! Configuration is an explicit value handed to [`BlobCache::new`] at
//! startup; nothing here is global or hot-reloaded.
//!
//! [`BlobCache::new`]: crate::cache::BlobCache::new

use crate::error::{CacheError, Result};
use crate::types::DriverKind;
use std::path::PathBuf;
use std::time::Duration;

/// Default upper limit on total cache size: 10 GiB.
///
/// This is a threshold for `prune` to act on, not a hard limit; the cache
/// can exceed it between prune runs.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default grace period before an incomplete entry counts as stalled: 24h.
pub const DEFAULT_STALL_TIME_SECS: u64 = 24 * 60 * 60;

/// Blob cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Which driver variant to configure first. On configuration failure
    /// the cache falls back to [`DriverKind::Sqlite`].
    pub driver: DriverKind,
    /// Base directory holding Active entries plus the `incomplete/`,
    /// `invalid/` and `queue/` state subdirectories.
    pub dir: PathBuf,
    /// Prune threshold in bytes.
    pub max_size: u64,
    /// How long an incomplete entry may sit untouched before `clean`
    /// reaps it.
    pub stall_time_secs: u64,
}

impl CacheConfig {
    /// Configuration rooted at `dir` with defaults for everything else.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            driver: DriverKind::default(),
            dir: dir.into(),
            max_size: DEFAULT_MAX_CACHE_SIZE,
            stall_time_secs: DEFAULT_STALL_TIME_SECS,
        }
    }

    /// Load configuration from the environment.
    ///
    /// Reads `BLOB_CACHE_DIR` (required), `BLOB_CACHE_DRIVER`,
    /// `BLOB_CACHE_MAX_SIZE` and `BLOB_CACHE_STALL_TIME`. Fails fast with a
    /// configuration error when the directory is unset.
    pub fn from_env() -> Result<Self> {
        let dir = std::env::var("BLOB_CACHE_DIR")
            .map(PathBuf::from)
            .map_err(|_| CacheError::Config("BLOB_CACHE_DIR is not set".to_string()))?;

        let driver = std::env::var("BLOB_CACHE_DRIVER")
            .ok()
            .map(|s| s.parse::<DriverKind>())
            .transpose()
            .map_err(CacheError::Config)?
            .unwrap_or_default();

        let max_size = std::env::var("BLOB_CACHE_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_MAX_CACHE_SIZE);

        let stall_time_secs = std::env::var("BLOB_CACHE_STALL_TIME")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_STALL_TIME_SECS);

        Ok(Self {
            driver,
            dir,
            max_size,
            stall_time_secs,
        })
    }

    pub fn stall_time(&self) -> Duration {
        Duration::from_secs(self.stall_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// The environment is process-global; tests that touch it take this
    /// lock so they do not race each other under the parallel test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "BLOB_CACHE_DIR",
            "BLOB_CACHE_DRIVER",
            "BLOB_CACHE_MAX_SIZE",
            "BLOB_CACHE_STALL_TIME",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_from_env_fails_fast_without_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        match CacheConfig::from_env() {
            Err(CacheError::Config(msg)) => assert!(msg.contains("BLOB_CACHE_DIR")),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_env_dir_only_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("BLOB_CACHE_DIR", "/var/cache/blobs");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.dir, PathBuf::from("/var/cache/blobs"));
        assert_eq!(config.driver, DriverKind::Sqlite);
        assert_eq!(config.max_size, DEFAULT_MAX_CACHE_SIZE);
        assert_eq!(config.stall_time_secs, DEFAULT_STALL_TIME_SECS);
        clear_env();
    }

    #[test]
    fn test_from_env_parses_all_settings() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("BLOB_CACHE_DIR", "/srv/blob-cache");
        std::env::set_var("BLOB_CACHE_DRIVER", "xattr");
        std::env::set_var("BLOB_CACHE_MAX_SIZE", "2048");
        std::env::set_var("BLOB_CACHE_STALL_TIME", "600");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.dir, PathBuf::from("/srv/blob-cache"));
        assert_eq!(config.driver, DriverKind::Xattr);
        assert_eq!(config.max_size, 2048);
        assert_eq!(config.stall_time_secs, 600);
        clear_env();
    }

    #[test]
    fn test_new_defaults() {
        let config = CacheConfig::new("/var/cache/blobs");
        assert_eq!(config.driver, DriverKind::Sqlite);
        assert_eq!(config.max_size, DEFAULT_MAX_CACHE_SIZE);
        assert_eq!(config.stall_time_secs, DEFAULT_STALL_TIME_SECS);
        assert_eq!(config.dir, PathBuf::from("/var/cache/blobs"));
    }

    #[test]
    fn test_stall_time_duration() {
        let mut config = CacheConfig::new("/tmp/cache");
        config.stall_time_secs = 10;
        assert_eq!(config.stall_time(), Duration::from_secs(10));
    }
}
