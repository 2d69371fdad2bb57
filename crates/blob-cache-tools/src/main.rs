//! Blob cache maintenance commands
//!
//! Operator tooling around the cache facade, intended to run as periodic
//! jobs (cron) or ad hoc: `prune` keeps the cache within its size budget,
//! `clean` reaps failed and stalled writes, the rest are queue and listing
//! admin.

use blob_cache::{BlobCache, CacheConfig, CacheError, Result};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

const USAGE: &str = "usage: blob-cache-tools <command>

commands:
  prune                  evict least-recently-accessed blobs over the size budget
  clean                  reap invalid entries and stalled incomplete entries
  queue <blob_id>        queue a blob for prefetch
  list-cached            list cached blobs
  list-queued            list queued blob ids in FIFO order
  delete-all-cached      delete every cached blob
  delete-all-queued      delete every queue marker

configuration (environment):
  BLOB_CACHE_DIR         cache base directory (required)
  BLOB_CACHE_DRIVER      driver variant: sqlite (default) or xattr
  BLOB_CACHE_MAX_SIZE    prune threshold in bytes
  BLOB_CACHE_STALL_TIME  stall grace period in seconds";

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env().add_directive(
        "blob_cache=info"
            .parse()
            .map_err(|e| CacheError::Config(format!("bad log directive: {}", e)))?,
    );

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let command = match args.next() {
        Some(command) => command,
        None => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let config = CacheConfig::from_env()?;
    info!(dir = %config.dir.display(), driver = %config.driver, "opening blob cache");
    let cache = BlobCache::new(config)?;

    match command.as_str() {
        "prune" => {
            let (files, bytes) = cache.prune().await?;
            info!(files, bytes, "prune finished");
        }
        "clean" => {
            let reaped = cache.clean(None).await?;
            info!(reaped, "clean finished");
        }
        "queue" => {
            let blob_id = args.next().ok_or_else(|| {
                CacheError::Config("queue requires a blob id argument".to_string())
            })?;
            let queued = cache.queue_blob(&blob_id).await?;
            if queued {
                info!(blob_id = %blob_id, "blob queued for prefetch");
            } else {
                info!(blob_id = %blob_id, "blob not queued (already cached, being cached or queued)");
            }
        }
        "list-cached" => {
            for entry in cache.cached_blobs().await? {
                println!(
                    "{}\t{} bytes\t{} hits\tlast accessed {}",
                    entry.blob_id, entry.size, entry.hits, entry.last_accessed
                );
            }
        }
        "list-queued" => {
            for blob_id in cache.queued_blobs().await? {
                println!("{}", blob_id);
            }
        }
        "delete-all-cached" => {
            let deleted = cache.delete_all_cached_blobs().await?;
            info!(deleted, "deleted all cached blobs");
        }
        "delete-all-queued" => {
            let deleted = cache.delete_all_queued_blobs().await?;
            info!(deleted, "deleted all queued blobs");
        }
        other => {
            eprintln!("unknown command '{}'\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }

    Ok(())
}
