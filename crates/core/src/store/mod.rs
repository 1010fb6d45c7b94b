//! Versioned persistent store.
//!
//! ```text
//!   EntryStore        typed CacheEntry records, checksums, optimistic puts
//!        │
//!        ▼
//!   KvSubstrate       bytes + per-key version counter
//!        │
//!        ├── InMemorySubstrate   (this crate)
//!        └── SqliteSubstrate     (storage-sqlite crate)
//! ```
//!
//! The store is the only writer of entry bytes. Every record is wrapped in an
//! envelope carrying its schema version and a SHA-256 checksum of the entry;
//! a record that fails either check is reported as corrupt and treated as
//! absent by readers.

mod entry_store;
mod manifest;
mod memory;
mod substrate;

pub use entry_store::{EntryStore, Lookup, PutOutcome, Snapshot};
pub use manifest::StoreManifest;
pub use memory::InMemorySubstrate;
pub use substrate::{BatchOp, ExpectedVersion, KvSubstrate, Versioned, WriteOutcome};

pub(crate) use entry_store::{decode_record, encode_record, RawRecord};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Substrate key of the manifest record.
pub const MANIFEST_KEY: &str = "manifest";
