//! Database model for cache records.

use diesel::prelude::*;
use quotevault_core::store::Versioned;

/// One substrate key with its bytes and version counter. A deleted key
/// keeps its row, emptied and flagged, so its version never restarts.
#[derive(Queryable, Selectable, Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::cache_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CacheRecordDB {
    pub key: String,
    pub version: i64,
    pub value: Vec<u8>,
    pub updated_at: String,
    pub deleted: bool,
}

impl CacheRecordDB {
    pub fn new(key: String, version: u64, value: Vec<u8>) -> Self {
        Self {
            key,
            version: to_column(version),
            value,
            updated_at: chrono::Utc::now().to_rfc3339(),
            deleted: false,
        }
    }

    pub fn into_versioned(self) -> (String, Versioned) {
        let version = from_column(self.version);
        (
            self.key,
            Versioned {
                bytes: self.value,
                version,
            },
        )
    }
}

// Versions start at 1 and only grow, so the sign bit is never used.
pub(crate) fn from_column(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}

pub(crate) fn to_column(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}
