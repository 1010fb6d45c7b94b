use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-wide record of the on-disk schema version.
///
/// Created on first open and mutated only by the schema upgrader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreManifest {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
}

impl StoreManifest {
    pub fn new(schema_version: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            schema_version,
            created_at,
        }
    }
}
