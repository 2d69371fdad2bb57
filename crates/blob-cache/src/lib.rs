//! Node-local disk cache for artifact blobs
//!
//! Each serving process keeps its own independent cache on local disk with
//! no cross-node coordination. Downloads are tee'd into the cache while
//! they stream to the consumer, with checksum verification deciding
//! whether the entry is committed; caching is strictly best-effort and
//! never affects what the consumer receives. Size-based LRU pruning and
//! cleanup of failed or stalled writes run as separate maintenance passes.

pub mod cache;
pub mod config;
pub mod drivers;
pub mod error;
pub mod types;

pub use cache::{BlobCache, ChunkStream, ReadGuard};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use types::{CacheEntry, DriverKind};
