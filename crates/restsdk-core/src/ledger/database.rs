//! SQLite bookkeeping tables for copy progress
//!
//! The ledger lives in the same database as the device index, in two tables
//! created on startup if absent. Every mutation opens its own connection,
//! runs one auto-committing statement and closes, so concurrent workers
//! never hold a write lock for longer than a single insert.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RestoreError, Result};
use crate::index::value_to_string;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRIES: u32 = 5;
const BATCH_SIZE: usize = 1000;

/// Durable copy/skip ledger backed by the index database
#[derive(Debug, Clone)]
pub struct LedgerStore {
    db_path: PathBuf,
    retries: u32,
}

/// One row of `copied_files`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedEntry {
    pub file_id: String,
    pub content_id: String,
    pub copied_at: Option<String>,
}

/// One row of `skipped_files`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub content_id: String,
    pub reason: Option<String>,
    pub skipped_at: Option<String>,
}

/// Record and ledger totals straight from the database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_files: u64,
    pub total_dirs: u64,
    pub copied_files: u64,
    pub skipped_files: u64,
    pub remaining: u64,
    pub percent_complete: f64,
}

impl LedgerStore {
    /// Open the ledger in an existing index database, creating its tables
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if !db_path.is_file() {
            return Err(RestoreError::Storage(format!(
                "database not found: {}",
                db_path.display()
            )));
        }

        let store = Self {
            db_path,
            retries: DEFAULT_RETRIES,
        };
        store.with_retry(initialize_schema)?;
        tracing::debug!("Ledger tables ready in {}", store.db_path.display());
        Ok(store)
    }

    /// Use existing ledger tables without creating anything; `None` when the
    /// database has never held a ledger
    pub fn attach(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let db_path = path.as_ref().to_path_buf();
        if !db_path.is_file() {
            return Err(RestoreError::Storage(format!(
                "database not found: {}",
                db_path.display()
            )));
        }

        let store = Self {
            db_path,
            retries: DEFAULT_RETRIES,
        };
        let tables: i64 = store.with_retry(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('copied_files', 'skipped_files')",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(if tables == 2 { Some(store) } else { None })
    }

    /// Retries for busy/locked statements before reporting a ledger fault
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Record a copied file; returns false when it was already recorded
    pub fn mark_copied(&self, file_id: &str, content_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.with_retry(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO copied_files (file_id, filename, copied_at) VALUES (?1, ?2, ?3)",
                params![file_id, content_id, now],
            )
        })?;
        Ok(inserted > 0)
    }

    /// Record a blob as permanently skipped; returns false when already recorded
    pub fn mark_skipped(&self, content_id: &str, reason: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.with_retry(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO skipped_files (filename, reason, skipped_at) VALUES (?1, ?2, ?3)",
                params![content_id, reason, now],
            )
        })?;
        Ok(inserted > 0)
    }

    /// Insert many copied rows, one transaction per batch.
    ///
    /// Used by the single-threaded destination rescan only.
    pub fn mark_copied_batch(&self, entries: &[(String, String)]) -> Result<usize> {
        let mut inserted = 0;
        for chunk in entries.chunks(BATCH_SIZE) {
            inserted += self.with_retry(|conn| {
                let now = Utc::now().to_rfc3339();
                let tx = conn.unchecked_transaction()?;
                let mut count = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO copied_files (file_id, filename, copied_at) VALUES (?1, ?2, ?3)",
                    )?;
                    for (file_id, content_id) in chunk {
                        count += stmt.execute(params![file_id, content_id, now])?;
                    }
                }
                tx.commit()?;
                Ok(count)
            })?;
        }
        Ok(inserted)
    }

    /// Content ids of every copied row
    pub fn copied_content_ids(&self) -> Result<HashSet<String>> {
        self.with_retry(|conn| {
            let mut stmt =
                conn.prepare("SELECT filename FROM copied_files WHERE filename IS NOT NULL")?;
            let ids = stmt
                .query_map([], |row| Ok(value_to_string(row.get_ref(0)?)))?
                .filter_map(|r| r.transpose())
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(ids)
        })
    }

    /// Content ids of every skipped row
    pub fn skipped_content_ids(&self) -> Result<HashSet<String>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare("SELECT filename FROM skipped_files")?;
            let ids = stmt
                .query_map([], |row| Ok(value_to_string(row.get_ref(0)?)))?
                .filter_map(|r| r.transpose())
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(ids)
        })
    }

    pub fn copied_entries(&self) -> Result<Vec<CopiedEntry>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_id, filename, copied_at FROM copied_files ORDER BY rowid",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(CopiedEntry {
                        file_id: value_to_string(row.get_ref(0)?).unwrap_or_default(),
                        content_id: value_to_string(row.get_ref(1)?).unwrap_or_default(),
                        copied_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn skipped_entries(&self) -> Result<Vec<SkippedEntry>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT filename, reason, skipped_at FROM skipped_files ORDER BY rowid",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(SkippedEntry {
                        content_id: value_to_string(row.get_ref(0)?).unwrap_or_default(),
                        reason: row.get(1)?,
                        skipped_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn copied_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM copied_files")
    }

    pub fn skipped_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM skipped_files")
    }

    /// Totals for status reports and pre-flight checks
    pub fn stats(&self) -> Result<IndexStats> {
        let total_files = self.count(
            "SELECT COUNT(*) FROM files WHERE contentID IS NOT NULL AND contentID != ''",
        )?;
        let total_dirs =
            self.count("SELECT COUNT(*) FROM files WHERE contentID IS NULL OR contentID = ''")?;
        let copied_files = self.copied_count()?;
        let skipped_files = self.skipped_count()?;

        let percent_complete = if total_files > 0 {
            copied_files as f64 / total_files as f64 * 100.0
        } else {
            0.0
        };

        Ok(IndexStats {
            total_files,
            total_dirs,
            copied_files,
            skipped_files,
            remaining: total_files.saturating_sub(copied_files + skipped_files),
            percent_complete,
        })
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let count: i64 = self.with_retry(|conn| conn.query_row(sql, [], |row| row.get(0)))?;
        Ok(count.max(0) as u64)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Run one self-contained operation on a fresh connection, retrying
    /// while the database is busy or locked.
    fn with_retry<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            match self.connect().and_then(|conn| op(&conn)) {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!("Ledger busy (attempt {}/{}): {}", attempt, self.retries, e);
                    std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                Err(e) => return Err(RestoreError::Ledger(e)),
            }
        }
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Create the ledger tables if absent and add columns older ledgers lack
fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS copied_files (
            file_id TEXT PRIMARY KEY,
            filename TEXT,
            copied_at TEXT
        );

        CREATE TABLE IF NOT EXISTS skipped_files (
            filename TEXT PRIMARY KEY,
            reason TEXT,
            skipped_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_copied_files_filename
            ON copied_files(filename);
        "#,
    )?;

    ensure_column(conn, "copied_files", "copied_at", "TEXT")?;
    ensure_column(conn, "skipped_files", "reason", "TEXT")?;
    ensure_column(conn, "skipped_files", "skipped_at", "TEXT")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .iter()
        .any(|c| c.eq_ignore_ascii_case(column));

    if !exists {
        tracing::info!("Adding missing column {}.{}", table, column);
        conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))?;
    }
    Ok(())
}
