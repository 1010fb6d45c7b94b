//! Connection management for the SQLite substrate.
//!
//! Reads go through an r2d2 pool. Writes go through the single writer actor
//! in [`write_actor`], which owns one pooled connection.

use log::{error, info};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use diesel::connection::{Connection, SimpleConnection};
use diesel::r2d2;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::errors::StorageError;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// File name of the cache database inside the data directory.
pub const DB_FILE_NAME: &str = "quotevault.db";

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

pub mod write_actor;
pub use write_actor::{spawn_writer, WriteHandle};

/// Resolve the database path under `app_data_dir` and create its directory.
pub fn init(app_data_dir: &str) -> Result<String, StorageError> {
    let db_path = get_db_path(app_data_dir);

    if let Some(db_dir) = Path::new(&db_path).parent() {
        if !db_dir.as_os_str().is_empty() && !db_dir.exists() {
            fs::create_dir_all(db_dir)?;
        }
    }

    Ok(db_path)
}

/// Switch the database file at `db_path` to WAL. The journal mode is stored
/// in the file, so pooled connections opened afterwards inherit it.
pub fn enable_wal(db_path: &str) -> Result<(), StorageError> {
    let mut conn = SqliteConnection::establish(db_path)?;
    conn.batch_execute(
        "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 30000;
            PRAGMA synchronous  = NORMAL;
        ",
    )?;
    Ok(())
}

pub fn create_pool(db_path: &str) -> Result<Arc<DbPool>, StorageError> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path);
    let pool = r2d2::Pool::builder()
        .max_size(8)
        .min_idle(Some(1))
        .connection_timeout(Duration::from_secs(30))
        .connection_customizer(Box::new(ConnectionCustomizer {}))
        .build(manager)?;
    Ok(Arc::new(pool))
}

pub fn run_migrations(pool: &DbPool) -> Result<(), StorageError> {
    info!("Running database migrations");
    let mut connection = get_connection(pool)?;

    let applied = connection.run_pending_migrations(MIGRATIONS).map_err(|e| {
        error!("Database migration failed: {}", e);
        StorageError::MigrationFailed(e.to_string())
    })?;

    if applied.is_empty() {
        info!("No pending migrations to apply.");
    } else {
        for version in &applied {
            info!("Applied migration {}", version);
        }
    }

    Ok(())
}

/// Database path for `app_data_dir`, unless `DATABASE_URL` overrides it.
pub fn get_db_path(app_data_dir: &str) -> String {
    resolve_db_path(app_data_dir, std::env::var("DATABASE_URL").ok())
}

fn resolve_db_path(app_data_dir: &str, override_url: Option<String>) -> String {
    override_url
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| {
            Path::new(app_data_dir)
                .join(DB_FILE_NAME)
                .to_string_lossy()
                .into_owned()
        })
}

/// Gets a connection from the pool
pub fn get_connection(
    pool: &Pool<ConnectionManager<SqliteConnection>>,
) -> Result<DbConnection, StorageError> {
    Ok(pool.get()?)
}

#[derive(Debug)]
struct ConnectionCustomizer;

impl r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionCustomizer {
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "
            PRAGMA busy_timeout = 30000;
            PRAGMA synchronous = NORMAL;
        ",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}
