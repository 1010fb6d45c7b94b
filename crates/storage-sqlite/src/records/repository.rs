use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::SqliteConnection;
use log::{debug, info};

use quotevault_core::store::{BatchOp, ExpectedVersion, KvSubstrate, Versioned, WriteOutcome};
use quotevault_core::Result;

use super::model::{from_column, CacheRecordDB};
use crate::db::{self, get_connection, DbPool, WriteHandle};
use crate::errors::{IntoCore, StorageError};
use crate::schema::cache_records;

/// [`KvSubstrate`] backed by one SQLite table.
///
/// Reads run on the blocking pool against pooled connections, so they proceed
/// while a write is in flight. Writes go through the single writer actor;
/// each conditional write checks and bumps the version inside one immediate
/// transaction.
pub struct SqliteSubstrate {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SqliteSubstrate {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        SqliteSubstrate { pool, writer }
    }

    /// Open (or create) the database under `app_data_dir` and apply pending
    /// migrations. Must be called inside a Tokio runtime.
    pub fn open(app_data_dir: &str) -> Result<Self> {
        let db_path = db::init(app_data_dir)?;
        Self::open_path(&db_path)
    }

    /// Open the database file at `db_path` directly, in WAL mode.
    pub fn open_path(db_path: &str) -> Result<Self> {
        db::enable_wal(db_path)?;
        let pool = db::create_pool(db_path)?;
        db::run_migrations(&pool)?;
        let writer = db::spawn_writer(&pool)?;
        info!("Opened SQLite cache substrate at {}", db_path);
        Ok(Self::new(pool, writer))
    }

    async fn with_reader<F, T>(&self, query: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = get_connection(&pool)?;
            query(&mut *conn)
        })
        .await
        .map_err(|e| StorageError::ReadTask(e.to_string()))?
    }
}

/// Version of the live record under `key`, and the last version the key
/// ever had, deleted or not.
fn current_version(conn: &mut SqliteConnection, key: &str) -> Result<(Option<u64>, u64)> {
    let row = cache_records::table
        .find(key)
        .select((cache_records::version, cache_records::deleted))
        .first::<(i64, bool)>(conn)
        .optional()
        .into_core()?;
    Ok(match row {
        Some((version, false)) => (Some(from_column(version)), from_column(version)),
        Some((version, true)) => (None, from_column(version)),
        None => (None, 0),
    })
}

fn upsert(conn: &mut SqliteConnection, record: &CacheRecordDB) -> Result<()> {
    diesel::insert_into(cache_records::table)
        .values(record)
        .on_conflict(cache_records::key)
        .do_update()
        .set((
            cache_records::version.eq(excluded(cache_records::version)),
            cache_records::value.eq(excluded(cache_records::value)),
            cache_records::updated_at.eq(excluded(cache_records::updated_at)),
            cache_records::deleted.eq(excluded(cache_records::deleted)),
        ))
        .execute(conn)
        .into_core()?;
    Ok(())
}

fn remove(conn: &mut SqliteConnection, key: &str) -> Result<bool> {
    let removed = diesel::update(
        cache_records::table
            .find(key)
            .filter(cache_records::deleted.eq(false)),
    )
    .set((
        cache_records::deleted.eq(true),
        cache_records::value.eq(Vec::<u8>::new()),
        cache_records::updated_at.eq(chrono::Utc::now().to_rfc3339()),
    ))
    .execute(conn)
    .into_core()?;
    Ok(removed > 0)
}

fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl KvSubstrate for SqliteSubstrate {
    async fn read(&self, key: &str) -> Result<Option<Versioned>> {
        let key = key.to_string();
        self.with_reader(move |conn| {
            let record = cache_records::table
                .find(&key)
                .filter(cache_records::deleted.eq(false))
                .select(CacheRecordDB::as_select())
                .first(conn)
                .optional()
                .into_core()?;
            Ok(record.map(|r| r.into_versioned().1))
        })
        .await
    }

    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: ExpectedVersion,
    ) -> Result<WriteOutcome> {
        let key = key.to_string();
        self.writer
            .exec(move |conn| -> Result<WriteOutcome> {
                let (current, last) = current_version(conn, &key)?;
                if !expected.matches(current) {
                    debug!("Write to {} rejected: version is {:?}", key, current);
                    return Ok(WriteOutcome::Conflict);
                }
                let version = last + 1;
                upsert(conn, &CacheRecordDB::new(key, version, value))?;
                Ok(WriteOutcome::Written { version })
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.writer.exec(move |conn| remove(conn, &key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let prefix = prefix.to_string();
        self.with_reader(move |conn| {
            let records = cache_records::table
                .filter(cache_records::key.like(like_prefix(&prefix)).escape('\\'))
                .filter(cache_records::deleted.eq(false))
                .order(cache_records::key.asc())
                .select(CacheRecordDB::as_select())
                .load(conn)
                .into_core()?;
            // LIKE ignores ASCII case; keep exact prefix matches only.
            Ok(records
                .into_iter()
                .filter(|r| r.key.starts_with(&prefix))
                .map(CacheRecordDB::into_versioned)
                .collect())
        })
        .await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.writer
            .exec(move |conn| -> Result<()> {
                for op in ops {
                    match op {
                        BatchOp::Put { key, value } => {
                            let (_, last) = current_version(conn, &key)?;
                            let version = last + 1;
                            upsert(conn, &CacheRecordDB::new(key, version, value))?;
                        }
                        BatchOp::Delete { key } => {
                            remove(conn, &key)?;
                        }
                    }
                }
                Ok(())
            })
            .await
    }
}
