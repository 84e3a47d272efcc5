use std::path::Path;
use std::time::Duration;

use include_dir::{include_dir, Dir};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Params, Transaction, TransactionBehavior};
use rusqlite_migration::Migrations;

use crate::error::{CatalogError, Result};

static MIGRATIONS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/migrations");

const FILE_POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the catalog database. Cheap to clone; every clone shares the
/// same connection pool.
#[derive(Clone)]
pub struct Db {
    pool: Pool<SqliteConnectionManager>,
}

impl Db {
    /// Opens a private in-memory database. The pool holds a single
    /// connection that is never recycled, since closing it would discard
    /// the data.
    pub fn open_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(Self::manager(SqliteConnectionManager::memory(), false))?;
        Self::from_pool(pool)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(FILE_POOL_SIZE)
            .build(Self::manager(SqliteConnectionManager::file(path), true))?;
        Self::from_pool(pool)
    }

    /// Opens `memory://`, `file://path/to/catalog.db`, or a bare path.
    pub fn open_url(url: &str) -> Result<Self> {
        let url = url.trim();
        if url == "memory://" || url == ":memory:" {
            return Self::open_memory();
        }
        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(CatalogError::InvalidDatabaseUrl(
                    "file:// URL must include a path".to_string(),
                ));
            }
            return Self::open(path);
        }
        if let Some((scheme, _)) = url.split_once("://") {
            return Err(CatalogError::InvalidDatabaseUrl(format!(
                "unsupported scheme {}, use memory:// or file://",
                scheme
            )));
        }
        if url.is_empty() {
            return Err(CatalogError::InvalidDatabaseUrl("empty database URL".to_string()));
        }
        Self::open(url)
    }

    fn manager(manager: SqliteConnectionManager, wal: bool) -> SqliteConnectionManager {
        manager.with_init(move |conn| {
            if wal {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            }
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        })
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        let db = Db { pool };
        db.migrate()?;
        Ok(db)
    }

    /// Brings the schema up to the latest embedded migration.
    pub fn migrate(&self) -> Result<()> {
        let migrations = Migrations::from_directory(&MIGRATIONS_DIR)?;
        let mut conn = self.pool.get()?;
        migrations.to_latest(&mut conn)?;
        log::debug!("database migrated to latest version");
        Ok(())
    }

    /// Calls the closure with a pooled connection for reading. The
    /// connection goes back to the pool when the closure returns.
    pub fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Calls the supplied closure with a write transaction. Commits
    /// if the closure returns Ok, otherwise rolls back.
    ///
    /// The transaction is IMMEDIATE, so writers queue on the database lock
    /// instead of interleaving.
    pub fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        let mut conn = self.pool.get()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }
}

/// Executes a statement, logging it the same way for every schema and data
/// change.
pub(crate) fn execute<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<usize> {
    log::debug!("SQL EXECUTE: {}", sql);
    let affected = conn.execute(sql, params)?;
    log::debug!("SQL EXECUTE RESULT: {} rows affected", affected);
    Ok(affected)
}

/// Quotes an identifier for interpolation into SQL. Field names are
/// validated before they get here; quoting keeps reserved words usable.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
