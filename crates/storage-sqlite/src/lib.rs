//! SQLite substrate for the quotevault cache.
//!
//! This crate is the only place where Diesel dependencies exist. The core
//! crate works against the `KvSubstrate` trait; this crate implements it on
//! one SQLite table.
//!
//! ```text
//!   quotevault-core (EntryStore, SchemaUpgrader)
//!                  │ KvSubstrate
//!                  ▼
//!   SqliteSubstrate ── reads ──► r2d2 pool
//!                  └── writes ─► writer actor (immediate transactions)
//!                  │
//!                  ▼
//!              SQLite DB (WAL)
//! ```

pub mod db;
pub mod errors;
pub mod records;
pub mod schema;

pub use db::{
    create_pool, get_connection, get_db_path, init, run_migrations, spawn_writer, DbConnection,
    DbPool, WriteHandle,
};
pub use errors::{IntoCore, StorageError};
pub use records::SqliteSubstrate;
