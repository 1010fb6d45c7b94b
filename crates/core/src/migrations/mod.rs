//! Schema upgrader.
//!
//! Runs once per store open. Detects the on-disk version from the manifest
//! and applies the step chain one version at a time:
//!
//! ```text
//!   manifest v1 ──step──► batch { every v1 record → v2, manifest = 2 }
//!               ──step──► batch { every v2 record → v3, manifest = 3 }
//! ```
//!
//! Each step is committed as a single atomic substrate batch, so a failing
//! step leaves the store exactly at the last committed version. There is no
//! downgrade path.

mod steps;

pub use steps::{default_chain, v1_to_v2, v2_to_v3, MigrationStep, UNKNOWN_PROVIDER};

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::model::ENTRY_PREFIX;
use crate::store::{
    decode_record, encode_record, BatchOp, EntryStore, KvSubstrate, StoreManifest, MANIFEST_KEY,
};

/// Brings a store to the current schema version.
pub struct SchemaUpgrader {
    substrate: Arc<dyn KvSubstrate>,
    clock: Arc<dyn Clock>,
    steps: Vec<MigrationStep>,
}

impl SchemaUpgrader {
    pub fn new(substrate: Arc<dyn KvSubstrate>, clock: Arc<dyn Clock>) -> Self {
        Self::with_steps(substrate, clock, default_chain())
    }

    /// Upgrader with a custom chain; `steps[i]` migrates version `i + 1`.
    pub fn with_steps(
        substrate: Arc<dyn KvSubstrate>,
        clock: Arc<dyn Clock>,
        steps: Vec<MigrationStep>,
    ) -> Self {
        Self {
            substrate,
            clock,
            steps,
        }
    }

    /// Version the chain ends at.
    pub fn target_version(&self) -> u32 {
        self.steps.len() as u32 + 1
    }

    /// Read the manifest, migrate as needed and return the final manifest.
    ///
    /// # Returns
    ///
    /// The manifest at the target version, or `MigrationFailed` /
    /// `UnsupportedSchemaVersion`. The store must not be served from after
    /// an error.
    pub async fn open_and_migrate(&self) -> Result<StoreManifest> {
        let target = self.target_version();
        let store = EntryStore::new(self.substrate.clone());

        let mut manifest = match store.read_manifest().await? {
            Some(manifest) => manifest,
            None => {
                let existing = self.substrate.scan_prefix(ENTRY_PREFIX).await?;
                if existing.is_empty() {
                    let manifest = StoreManifest::new(target, self.clock.now());
                    self.substrate
                        .write_batch(vec![manifest_op(&manifest)?])
                        .await?;
                    info!("Created cache store at schema version {}", target);
                    return Ok(manifest);
                }
                warn!(
                    "Cache store has {} entries but no manifest; treating it as version 1",
                    existing.len()
                );
                StoreManifest::new(1, self.clock.now())
            }
        };

        if manifest.schema_version > target {
            error!(
                "Cache store schema version {} is newer than this build ({})",
                manifest.schema_version, target
            );
            return Err(Error::UnsupportedSchemaVersion {
                found: manifest.schema_version,
                supported: target,
            });
        }
        if manifest.schema_version == target {
            debug!("Cache store already at schema version {}", target);
            return Ok(manifest);
        }

        info!(
            "Migrating cache store from schema version {} to {}",
            manifest.schema_version, target
        );
        while manifest.schema_version < target {
            let from = manifest.schema_version;
            manifest = match self.apply_step(&manifest).await {
                Ok(next) => next,
                Err(reason) => {
                    error!("Migration from schema version {} failed: {}", from, reason);
                    return Err(Error::MigrationFailed {
                        from_version: from,
                        reason,
                    });
                }
            };
        }
        Ok(manifest)
    }

    /// Rewrite every record of the manifest's version and bump the manifest,
    /// all in one batch.
    async fn apply_step(&self, manifest: &StoreManifest) -> std::result::Result<StoreManifest, String> {
        let from = manifest.schema_version;
        let step = from
            .checked_sub(1)
            .and_then(|i| self.steps.get(i as usize))
            .ok_or_else(|| format!("no migration step from version {}", from))?;

        let records = self
            .substrate
            .scan_prefix(ENTRY_PREFIX)
            .await
            .map_err(|e| e.to_string())?;

        let mut ops = Vec::with_capacity(records.len() + 1);
        let mut migrated = 0usize;
        for (key, stored) in records {
            let record = match decode_record(&stored.bytes) {
                Ok(record) => record,
                Err(reason) => {
                    warn!("Dropping corrupt record {} during migration: {}", key, reason);
                    ops.push(BatchOp::Delete { key });
                    continue;
                }
            };
            if record.schema_version > from {
                debug!(
                    "Record {} already at version {}, skipping",
                    key, record.schema_version
                );
                continue;
            }
            if record.schema_version < from {
                return Err(format!(
                    "record {} at version {} is behind the store",
                    key, record.schema_version
                ));
            }
            let entry = step(record.entry).map_err(|reason| format!("{}: {}", key, reason))?;
            let value = encode_record(from + 1, entry).map_err(|e| e.to_string())?;
            ops.push(BatchOp::Put { key, value });
            migrated += 1;
        }

        let next = StoreManifest::new(from + 1, manifest.created_at);
        ops.push(manifest_op(&next).map_err(|e| e.to_string())?);
        self.substrate
            .write_batch(ops)
            .await
            .map_err(|e| e.to_string())?;

        info!(
            "Migrated {} cache entries from schema version {} to {}",
            migrated,
            from,
            from + 1
        );
        Ok(next)
    }
}

fn manifest_op(manifest: &StoreManifest) -> Result<BatchOp> {
    Ok(BatchOp::Put {
        key: MANIFEST_KEY.to_string(),
        value: serde_json::to_vec(manifest)?,
    })
}
