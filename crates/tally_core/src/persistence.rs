use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::config::EngineConfig;
use crate::health::EndpointHealth;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A persisted balance record. The payload is an opaque JSON blob owned by
/// the balance cache store; this layer only keys it by record identity.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRow {
    pub id: String,
    pub payload: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite database holding the balance cache and per-endpoint health.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (or creates) the database at `~/.tally/tally.db`.
    pub fn open() -> Result<Self> {
        EngineConfig::ensure_dirs()?;
        let db_path = EngineConfig::db_path()?;
        Self::open_at(&db_path)
    }

    /// Opens (or creates) the SQLite database at the given path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self { conn };
        db.init_schema()?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Opens an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS endpoint_health (
                url TEXT PRIMARY KEY,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                total_failures INTEGER NOT NULL DEFAULT 0,
                last_latency_ms INTEGER,
                last_success TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS balances (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // -- Endpoint health ----------------------------------------------------

    pub fn upsert_endpoint_health(&self, health: &EndpointHealth) -> Result<()> {
        self.conn.execute(
            "INSERT INTO endpoint_health
                (url, consecutive_failures, total_failures, last_latency_ms, last_success, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(url) DO UPDATE SET
                consecutive_failures = excluded.consecutive_failures,
                total_failures = excluded.total_failures,
                last_latency_ms = excluded.last_latency_ms,
                last_success = excluded.last_success,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                health.url,
                health.consecutive_failures,
                health.total_failures as i64,
                health.last_latency_ms.map(|v| v as i64),
                health.last_success.map(|t| t.to_rfc3339()),
                health.last_error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_endpoint_health(&self, url: &str) -> Result<Option<EndpointHealth>> {
        let row = self
            .conn
            .query_row(
                "SELECT url, consecutive_failures, total_failures, last_latency_ms, last_success, last_error
                 FROM endpoint_health WHERE url = ?1",
                params![url],
                Self::map_health_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn load_endpoint_health(&self) -> Result<Vec<EndpointHealth>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, consecutive_failures, total_failures, last_latency_ms, last_success, last_error
             FROM endpoint_health ORDER BY url",
        )?;
        let rows = stmt
            .query_map([], Self::map_health_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_health_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EndpointHealth> {
        let last_success: Option<String> = row.get(4)?;
        Ok(EndpointHealth {
            url: row.get(0)?,
            consecutive_failures: row.get(1)?,
            total_failures: row.get::<_, i64>(2)? as u64,
            last_latency_ms: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
            last_success: last_success
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            last_error: row.get(5)?,
        })
    }

    // -- Balances -----------------------------------------------------------

    pub fn upsert_balance(&self, row: &BalanceRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO balances (id, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![row.id, row.payload, row.updated_at],
        )?;
        Ok(())
    }

    /// Delete a balance row. Returns `true` if a row was removed.
    pub fn delete_balance(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM balances WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn load_balances(&self) -> Result<Vec<BalanceRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload, updated_at FROM balances ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BalanceRow {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Insert or update `rows` in one transaction; other rows are untouched.
    pub fn upsert_balances(&mut self, rows: &[BalanceRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO balances (id, payload, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            )?;
            for row in rows {
                stmt.execute(params![row.id, row.payload, row.updated_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically replace the whole balance table with `rows`.
    pub fn replace_balances(&mut self, rows: &[BalanceRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM balances", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO balances (id, payload, updated_at) VALUES (?1, ?2, ?3)")?;
            for row in rows {
                stmt.execute(params![row.id, row.payload, row.updated_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
