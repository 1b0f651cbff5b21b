//! SQLite row store for the Foundry control plane.
//!
//! A single connection sits behind a mutex. Callers get a [`Db`] view either
//! through [`Store::read`] or [`Store::transaction`]; the latter commits only
//! when the closure returns `Ok`, so multi-row updates (a checkpoint write and
//! the phase check that depends on it) become visible together or not at all.
//!
//! The one concurrency primitive the queue relies on is [`Db::claim_job`], a
//! single conditional `UPDATE ... WHERE status = 'pending' RETURNING ...` that
//! hands the winner the row it claimed.

mod agents;
mod jobs;
mod reviews;
mod schema;
mod workflow;

use foundry_core::{FoundryError, FoundryResult};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Durable store for projects, agents, checkpoints, assets, interventions,
/// jobs, policies and snapshots.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> FoundryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).sql()?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .sql()?;
        debug!(path = %path.display(), journal_mode = %mode, "opened store");
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> FoundryResult<Self> {
        Self::init(Connection::open_in_memory().sql()?)
    }

    fn init(conn: Connection) -> FoundryResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON").sql()?;
        conn.execute_batch(schema::SCHEMA).sql()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` against the database without a transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Db<'_>) -> FoundryResult<T>) -> FoundryResult<T> {
        let conn = self.conn.lock();
        f(&Db { conn: &conn })
    }

    /// Run `f` inside a transaction, committing only if it returns `Ok`.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`), so several
    /// processes sharing one file wait on the busy timeout instead of failing
    /// a read-then-write upgrade.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Db<'_>) -> FoundryResult<T>,
    ) -> FoundryResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .sql()?;
        let out = f(&Db { conn: &tx })?;
        tx.commit().sql()?;
        Ok(out)
    }
}

/// Query surface over one connection or transaction.
pub struct Db<'c> {
    conn: &'c Connection,
}

/// Maps `rusqlite` errors into the storage variant of [`FoundryError`].
pub(crate) trait SqlContext<T> {
    fn sql(self) -> FoundryResult<T>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn sql(self) -> FoundryResult<T> {
        self.map_err(|e| FoundryError::Storage(e.to_string()))
    }
}

/// Read a text column through `FromStr` (status enums).
pub(crate) fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = FoundryError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: FoundryError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a JSON-encoded text column.
pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn count_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let n: i64 = row.get(idx)?;
    Ok(n.max(0) as u64)
}
