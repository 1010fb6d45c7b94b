use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::manifest::StoreManifest;
use super::substrate::{ExpectedVersion, KvSubstrate, WriteOutcome};
use super::{CURRENT_SCHEMA_VERSION, MANIFEST_KEY};
use crate::errors::{Error, Result, StoreError};
use crate::model::{symbol_prefix, CacheEntry, CacheKey, DatasetKind};

// =============================================================================
// Record envelope
// =============================================================================

/// On-substrate shape of every entry record.
#[derive(Serialize, Deserialize)]
struct RecordEnvelope {
    schema_version: u32,
    checksum: String,
    entry: Value,
}

/// A decoded envelope whose checksum matched.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RawRecord {
    pub schema_version: u32,
    pub entry: Value,
}

fn checksum(entry: &Value) -> Result<String> {
    let canonical = serde_json::to_vec(entry)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Wrap an entry document in a checksummed envelope.
pub(crate) fn encode_record(schema_version: u32, entry: Value) -> Result<Vec<u8>> {
    let envelope = RecordEnvelope {
        schema_version,
        checksum: checksum(&entry)?,
        entry,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Unwrap an envelope, verifying its checksum.
pub(crate) fn decode_record(bytes: &[u8]) -> std::result::Result<RawRecord, String> {
    let envelope: RecordEnvelope =
        serde_json::from_slice(bytes).map_err(|e| format!("unreadable envelope: {}", e))?;
    let actual = checksum(&envelope.entry).map_err(|e| e.to_string())?;
    if actual != envelope.checksum {
        return Err(format!(
            "checksum mismatch (stored {}, computed {})",
            envelope.checksum, actual
        ));
    }
    Ok(RawRecord {
        schema_version: envelope.schema_version,
        entry: envelope.entry,
    })
}

// =============================================================================
// Typed store
// =============================================================================

/// An entry as read, with the version a follow-up put must expect.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub entry: CacheEntry,
    pub version: u64,
}

/// Outcome of reading one key.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup {
    Missing,
    /// Bytes exist but failed the integrity check. Readers treat this as
    /// absent; writers overwrite it at `version`.
    Corrupt { version: u64 },
    Present(Snapshot),
}

impl Lookup {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Lookup::Present(snapshot) => Some(&snapshot.entry),
            _ => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            Lookup::Present(snapshot) => Some(snapshot.entry),
            _ => None,
        }
    }

    /// Precondition for a put that replaces what was read.
    pub fn expected(&self) -> ExpectedVersion {
        match self {
            Lookup::Missing => ExpectedVersion::Absent,
            Lookup::Corrupt { version } => ExpectedVersion::Exactly(*version),
            Lookup::Present(snapshot) => ExpectedVersion::Exactly(snapshot.version),
        }
    }
}

/// Result of an optimistic put.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Written { version: u64 },
    /// Someone else wrote the key since it was read.
    Conflict,
}

/// Typed access to cache entries over a [`KvSubstrate`].
#[derive(Clone)]
pub struct EntryStore {
    substrate: Arc<dyn KvSubstrate>,
}

impl EntryStore {
    pub fn new(substrate: Arc<dyn KvSubstrate>) -> Self {
        Self { substrate }
    }

    pub fn substrate(&self) -> &Arc<dyn KvSubstrate> {
        &self.substrate
    }

    /// Read one entry, classifying unreadable records as corrupt.
    pub async fn read(&self, key: &CacheKey) -> Result<Lookup> {
        let storage_key = key.storage_key();
        let Some(stored) = self.substrate.read(&storage_key).await? else {
            return Ok(Lookup::Missing);
        };

        match decode_entry(&stored.bytes) {
            Ok(entry) if entry.key() == *key => Ok(Lookup::Present(Snapshot {
                entry,
                version: stored.version,
            })),
            Ok(entry) => {
                let err = StoreError::CorruptEntry {
                    key: storage_key,
                    reason: format!("record belongs to {}", entry.key()),
                };
                warn!("{}; treating as absent", err);
                Ok(Lookup::Corrupt {
                    version: stored.version,
                })
            }
            Err(reason) => {
                let err = StoreError::CorruptEntry {
                    key: storage_key,
                    reason,
                };
                warn!("{}; treating as absent", err);
                Ok(Lookup::Corrupt {
                    version: stored.version,
                })
            }
        }
    }

    /// The entry under `key`, if present and intact.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.read(key).await?.into_entry())
    }

    /// Write `entry` under `key` if the stored version still matches.
    pub async fn put(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        expected: ExpectedVersion,
    ) -> Result<PutOutcome> {
        if entry.key() != *key {
            return Err(Error::InvalidRequest(format!(
                "Entry for {} cannot be stored under {}",
                entry.key(),
                key
            )));
        }
        let bytes = encode_record(CURRENT_SCHEMA_VERSION, serde_json::to_value(entry)?)?;
        match self
            .substrate
            .write(&key.storage_key(), bytes, expected)
            .await?
        {
            WriteOutcome::Written { version } => {
                debug!("Stored {} at version {}", key, version);
                Ok(PutOutcome::Written { version })
            }
            WriteOutcome::Conflict => {
                debug!("Version conflict storing {} (expected {:?})", key, expected);
                Ok(PutOutcome::Conflict)
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.substrate.delete(&key.storage_key()).await
    }

    /// Keys of every entry stored for `ticker`.
    pub async fn keys_for_symbol(&self, ticker: &str) -> Result<Vec<CacheKey>> {
        let prefix = symbol_prefix(ticker);
        let records = self.substrate.scan_prefix(&prefix).await?;
        let mut keys = Vec::with_capacity(records.len());
        for (storage_key, _) in records {
            let segment = &storage_key[prefix.len()..];
            match segment.parse::<DatasetKind>() {
                Ok(kind) => keys.push(CacheKey::new(ticker, kind)),
                Err(_) => warn!("Ignoring unrecognised cache key {}", storage_key),
            }
        }
        Ok(keys)
    }

    pub async fn read_manifest(&self) -> Result<Option<StoreManifest>> {
        let Some(stored) = self.substrate.read(MANIFEST_KEY).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&stored.bytes)
            .map(Some)
            .map_err(|e| {
                Error::Store(StoreError::CorruptEntry {
                    key: MANIFEST_KEY.to_string(),
                    reason: e.to_string(),
                })
            })
    }
}

fn decode_entry(bytes: &[u8]) -> std::result::Result<CacheEntry, String> {
    let record = decode_record(bytes)?;
    if record.schema_version != CURRENT_SCHEMA_VERSION {
        return Err(format!(
            "record at schema version {} in a version {} store",
            record.schema_version, CURRENT_SCHEMA_VERSION
        ));
    }
    let mut entry: CacheEntry =
        serde_json::from_value(record.entry).map_err(|e| format!("unreadable entry: {}", e))?;
    entry.schema_version = record.schema_version;
    Ok(entry)
}
