//! Connection lifecycle, PRAGMA setup and schema migrations.
//!
//! Every query goes through tokio-rusqlite's single background thread, which
//! serializes writes. Do NOT open a second connection for writes.

use std::{path::Path, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use rtb_core::{Error, Result};
use uuid::Uuid;

/// `(user_version, sql)`, applied in order inside one transaction each.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/V1__initial.sql"))];

#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Open (creating if needed) the database file and migrate it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        let db = Self::init(conn, true).await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Private in-memory database, mainly for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| Error::Storage(format!("open in-memory database: {e}")))?;
        Self::init(conn, false).await
    }

    async fn init(conn: tokio_rusqlite::Connection, wal: bool) -> Result<Self> {
        let version = conn
            .call(move |conn| {
                conn.busy_timeout(Duration::from_secs(5))?;
                if wal {
                    let _mode: String = conn.pragma_update_and_check(
                        None,
                        "journal_mode",
                        "WAL",
                        |row| row.get(0),
                    )?;
                    conn.pragma_update(None, "synchronous", "NORMAL")?;
                }
                migrate(conn)
            })
            .await
            .map_err(storage_err)?;
        tracing::debug!(schema_version = version, "database migrated");
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }
}

fn migrate(conn: &mut rusqlite::Connection) -> rusqlite::Result<i64> {
    let mut current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        current = *version;
    }
    Ok(current)
}

/// Convert a tokio-rusqlite error into `Error::Storage`.
pub(crate) fn storage_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> Error {
    Error::Storage(e.to_string())
}

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Storage(format!("bad uuid {s:?}: {e}")))
}
