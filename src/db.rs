//! SQLite connection provider
//!
//! Hands out connections with referential integrity enabled, the way the
//! FincaFácil application opens its database. Every schema operation in this
//! crate takes one of these connections explicitly.

use crate::config::Config;
use crate::error::{Error, Result};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides every other database path source
pub const DB_PATH_ENV: &str = "FINCAFACIL_DB_PATH";

/// Where the FincaFácil application keeps its database by default
pub const DEFAULT_DB_PATH: &str = "database/fincafacil.db";

/// Resolve the database path: env var, then explicit flag, then config, then default
pub fn resolve_db_path(explicit: Option<&Path>, config: &Config) -> PathBuf {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return PathBuf::from(path);
    }
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = config.database_path() {
        return path;
    }
    PathBuf::from(DEFAULT_DB_PATH)
}

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applies the per-connection pragmas every FincaFácil connection carries
#[derive(Debug, Clone, Copy)]
struct ConnectionPragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl Database {
    /// Open the database at `path` with default settings
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &Config::default())
    }

    /// Open the database at `path` using the connection settings from `config`
    pub fn open_with<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Connection(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        // One connection: pragma state is per-connection and migrations are single-operator
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_millis(config.database.busy_timeout_ms.max(1000)))
            .connection_customizer(Box::new(ConnectionPragmas {
                busy_timeout_ms: config.database.busy_timeout_ms,
            }))
            .build(manager)
            .map_err(|e| Error::Connection(e.to_string()))?;

        tracing::debug!(path = %path.display(), "opened database");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check out the connection
    pub fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Connection(e.to_string()))
    }
}

// ============================================================================
// Helper structs for raw SQL queries
// ============================================================================

/// Single `COUNT(*) AS count` result
#[derive(QueryableByName, Debug)]
pub(crate) struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    pub count: i64,
}

/// Single integer `value` result (pragmas read through `AS value`)
#[derive(QueryableByName, Debug)]
pub(crate) struct IntValue {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    pub value: i64,
}

/// Read an integer-valued pragma such as `foreign_keys`
pub(crate) fn read_pragma(conn: &mut SqliteConnection, pragma: &str) -> Result<i64> {
    let rows: Vec<IntValue> = diesel::sql_query(format!("SELECT {pragma} AS value FROM pragma_{pragma}()"))
        .load(conn)?;
    Ok(rows.first().map(|r| r.value).unwrap_or(0))
}

/// Whether referential integrity is currently enforced on this connection
pub fn foreign_keys_enabled(conn: &mut SqliteConnection) -> Result<bool> {
    Ok(read_pragma(conn, "foreign_keys")? != 0)
}

/// Open a private in-memory database with enforcement on, for tests
#[cfg(test)]
pub(crate) fn memory_conn() -> SqliteConnection {
    let mut conn = SqliteConnection::establish(":memory:").expect("in-memory sqlite");
    conn.batch_execute("PRAGMA foreign_keys = ON;")
        .expect("enable foreign keys");
    conn
}
