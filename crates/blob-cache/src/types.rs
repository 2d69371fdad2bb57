//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Record describing one fully-cached (Active) blob.
///
/// At most one Active entry exists per `blob_id` at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub blob_id: String,
    pub size: u64,
    pub hits: u64,
    pub last_modified: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// The available cache driver variants.
///
/// The variants differ in where they keep per-entry statistics: `Xattr`
/// stores them as extended attributes on the cached file itself, `Sqlite`
/// in an embedded database next to the cached files. `Sqlite` is the
/// default and the fallback when `Xattr` cannot be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverKind {
    Xattr,
    Sqlite,
}

impl Default for DriverKind {
    fn default() -> Self {
        DriverKind::Sqlite
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xattr" => Ok(DriverKind::Xattr),
            "sqlite" => Ok(DriverKind::Sqlite),
            other => Err(format!("unknown cache driver '{}'", other)),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Xattr => write!(f, "xattr"),
            DriverKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_from_str() {
        assert_eq!("xattr".parse::<DriverKind>().unwrap(), DriverKind::Xattr);
        assert_eq!("SQLite".parse::<DriverKind>().unwrap(), DriverKind::Sqlite);
        assert!("redis".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_driver_kind_display_round_trip() {
        for kind in [DriverKind::Xattr, DriverKind::Sqlite] {
            assert_eq!(kind.to_string().parse::<DriverKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_cache_entry_serialization() {
        let entry = CacheEntry {
            blob_id: "abc123".to_string(),
            size: 12345,
            hits: 7,
            last_modified: Utc::now(),
            last_accessed: Utc::now(),
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("abc123"));
        assert!(json.contains("12345"));

        let deserialized: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.blob_id, entry.blob_id);
        assert_eq!(deserialized.size, entry.size);
        assert_eq!(deserialized.hits, entry.hits);
    }
}
