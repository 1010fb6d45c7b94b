//! Storage-specific error types for SQLite operations.
//!
//! Diesel and r2d2 errors stay inside this crate. At the boundary they become
//! `quotevault_core::Error::Store(StoreError::Io)`, the one failure the cache
//! surfaces without retrying.

use diesel::result::Error as DieselError;
use quotevault_core::errors::{Error, StoreError};
use thiserror::Error;

/// Storage-specific errors that wrap Diesel and r2d2 types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Query execution failed: {0}")]
    QueryFailed(#[from] DieselError),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database file error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Writer unavailable: {0}")]
    WriterUnavailable(String),

    #[error("Background read failed: {0}")]
    ReadTask(String),

    /// A core error raised inside a write job, carried through the transaction.
    #[error(transparent)]
    Core(Error),
}

impl From<Error> for StorageError {
    fn from(err: Error) -> Self {
        StorageError::Core(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Core(e) => e,
            other => Error::Store(StoreError::Io(other.to_string())),
        }
    }
}

/// Extension trait for converting Diesel and pool results to core results.
pub trait IntoCore<T> {
    fn into_core(self) -> quotevault_core::Result<T>;
}

impl<T> IntoCore<T> for std::result::Result<T, DieselError> {
    fn into_core(self) -> quotevault_core::Result<T> {
        self.map_err(|e| StorageError::from(e).into())
    }
}

impl<T> IntoCore<T> for std::result::Result<T, r2d2::Error> {
    fn into_core(self) -> quotevault_core::Result<T> {
        self.map_err(|e| StorageError::from(e).into())
    }
}
