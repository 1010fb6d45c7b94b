//! QuoteVault Core - a local cache for financial-provider data.
//!
//! This crate decides when cached prices, corporate actions, financial
//! statements and option chains are stale, keeps them in a versioned store,
//! and refreshes many symbols at once without exceeding the provider's
//! request rate. It is persistence-agnostic: the SQLite substrate lives in
//! the `storage-sqlite` crate.
//!
//! ```text
//!   QuoteCache
//!       │
//!       ▼
//!   BatchOrchestrator ── leases, rate limiter, worker bound
//!       │
//!       ▼
//!   DatasetManagers ──► FreshnessEngine ──► Calendar
//!       │
//!       ▼
//!   EntryStore ──► KvSubstrate        (SchemaUpgrader runs on open)
//! ```

pub mod clock;
pub mod config;
pub mod datasets;
pub mod errors;
pub mod freshness;
pub mod migrations;
pub mod model;
pub mod orchestrator;
pub mod service;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{CacheConfig, FreshnessPolicy, HistoryConfig, OrchestratorConfig};
pub use datasets::{Adjustment, BarDiscrepancy, Fetched, VerifyTolerance};
pub use errors::{Error, Result, StoreError};
pub use freshness::{FreshnessEngine, Verdict};
pub use model::{CacheEntry, CacheKey, DatasetKind, DateRange, Payload, Provenance, SubKey};
pub use orchestrator::{BatchReport, RefreshOutcome};
pub use service::{PriceQuery, QuoteCache};
pub use store::{KvSubstrate, StoreManifest, CURRENT_SCHEMA_VERSION};
