use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::warn;

use super::substrate::{BatchOp, ExpectedVersion, KvSubstrate, Versioned, WriteOutcome};
use crate::errors::Result;

#[derive(Debug, Default)]
struct Records {
    live: BTreeMap<String, Versioned>,
    /// Last version of each deleted key.
    deleted: HashMap<String, u64>,
}

impl Records {
    fn next_version(&self, key: &str) -> u64 {
        self.live
            .get(key)
            .map(|v| v.version)
            .or_else(|| self.deleted.get(key).copied())
            .unwrap_or(0)
            + 1
    }

    fn put(&mut self, key: String, bytes: Vec<u8>) -> u64 {
        let version = self.next_version(&key);
        self.deleted.remove(&key);
        self.live.insert(key, Versioned { bytes, version });
        version
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.live.remove(key) {
            Some(old) => {
                self.deleted.insert(key.to_string(), old.version);
                true
            }
            None => false,
        }
    }
}

/// Process-local substrate backed by an ordered map.
#[derive(Debug, Default)]
pub struct InMemorySubstrate {
    records: Mutex<Records>,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| {
            warn!("In-memory substrate mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Number of stored keys, manifest included.
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }
}

#[async_trait]
impl KvSubstrate for InMemorySubstrate {
    async fn read(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.lock().live.get(key).cloned())
    }

    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: ExpectedVersion,
    ) -> Result<WriteOutcome> {
        let mut records = self.lock();
        let current = records.live.get(key).map(|v| v.version);
        if !expected.matches(current) {
            return Ok(WriteOutcome::Conflict);
        }
        let version = records.put(key.to_string(), value);
        Ok(WriteOutcome::Written { version })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().remove(key))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        Ok(self
            .lock()
            .live
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut records = self.lock();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    records.put(key, value);
                }
                BatchOp::Delete { key } => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}
