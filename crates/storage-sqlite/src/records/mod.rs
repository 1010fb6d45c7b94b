//! SQLite storage for cache records.

mod model;
mod repository;

pub use model::CacheRecordDB;
pub use repository::SqliteSubstrate;
