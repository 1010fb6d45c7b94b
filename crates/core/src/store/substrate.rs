use async_trait::async_trait;

use crate::errors::Result;

/// Bytes stored under a key, with the key's current version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub bytes: Vec<u8>,
    pub version: u64,
}

/// Precondition for a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Unconditional write.
    Any,
    /// The key must not exist.
    Absent,
    /// The key must currently hold this version.
    Exactly(u64),
}

impl ExpectedVersion {
    /// Whether a key currently at `current` satisfies the precondition.
    pub fn matches(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exactly(want), Some(have)) => *want == have,
            _ => false,
        }
    }
}

/// Result of a conditional write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    Conflict,
}

/// One operation of an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Byte-oriented key-value persistence.
///
/// Each successful write bumps the key's version by one, starting at 1.
/// A deleted key reads as absent but keeps its last version, so a later
/// write continues from it and a stale `Exactly` never matches again.
/// Implementations may serialize writes internally; reads must stay
/// concurrent.
#[async_trait]
pub trait KvSubstrate: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` if the key's version satisfies `expected`.
    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: ExpectedVersion,
    ) -> Result<WriteOutcome>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every key starting with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Apply all operations or none.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;
}
