//! Progress ledger: what has been copied or permanently skipped
//!
//! The durable half is two tables in the index database; the fallback half is
//! an append-only log of copied source paths. Workers read a snapshot taken at
//! run start and write through to both.

pub mod copy_log;
pub mod database;
pub mod regenerate;
pub mod snapshot;

pub use copy_log::CopyLog;
pub use database::{CopiedEntry, IndexStats, LedgerStore, SkippedEntry};
pub use regenerate::{
    regenerate_from_destination, scan_destination, RegenerateProgress, RegenerateReport,
};
pub use snapshot::LedgerSnapshot;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{RestoreError, Result};

/// Snapshot reads plus write-through to the store and the copy log
pub struct ProgressLedger {
    store: Option<LedgerStore>,
    copy_log: Option<CopyLog>,
    snapshot: LedgerSnapshot,
    degraded: AtomicBool,
}

impl ProgressLedger {
    /// Open the ledger tables in `db_path` and the optional copy log.
    ///
    /// A missing database is fatal. A store that cannot be written at all
    /// leaves the ledger running on the copy log alone.
    pub fn open(db_path: &Path, copy_log: Option<&Path>, retries: u32) -> Result<Self> {
        Self::from_open_result(db_path, LedgerStore::open(db_path), copy_log, retries)
    }

    /// Finish opening once the store has been tried. A store that could not
    /// be prepared for writing is still read for the snapshot when its tables
    /// already exist.
    fn from_open_result(
        db_path: &Path,
        opened: Result<LedgerStore>,
        copy_log: Option<&Path>,
        retries: u32,
    ) -> Result<Self> {
        let (store, degraded) = match opened {
            Ok(store) => (Some(store.with_retries(retries)), false),
            Err(RestoreError::Ledger(e)) => {
                tracing::warn!("⚠️  Ledger unavailable, tracking progress in the copy log only: {}", e);
                let existing = LedgerStore::attach(db_path).ok().flatten();
                if existing.is_some() {
                    tracing::info!("Reading existing ledger rows for this run");
                }
                (existing, true)
            }
            Err(e) => return Err(e),
        };

        let log = copy_log.map(CopyLog::open).transpose()?;
        let mut ledger = Self::new(store, log)?;
        ledger.degraded = AtomicBool::new(degraded);
        Ok(ledger)
    }

    /// Snapshot only, for dry runs: nothing is created or written
    pub fn read_only(db_path: &Path, copy_log: Option<&Path>) -> Result<Self> {
        let store = LedgerStore::attach(db_path)?;
        let snapshot = LedgerSnapshot::capture(store.as_ref(), copy_log)?;
        Ok(Self {
            store,
            copy_log: None,
            snapshot,
            degraded: AtomicBool::new(false),
        })
    }

    /// Build from parts, capturing the initial snapshot
    pub fn new(store: Option<LedgerStore>, copy_log: Option<CopyLog>) -> Result<Self> {
        let snapshot = LedgerSnapshot::capture(store.as_ref(), copy_log.as_ref().map(|l| l.path()))?;
        Ok(Self {
            store,
            copy_log,
            snapshot,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> Option<&LedgerStore> {
        self.store.as_ref()
    }

    pub fn snapshot(&self) -> &LedgerSnapshot {
        &self.snapshot
    }

    pub fn is_copied(&self, content_id: &str) -> bool {
        self.snapshot.is_copied(content_id)
    }

    pub fn is_skipped(&self, content_id: &str) -> bool {
        self.snapshot.is_skipped(content_id)
    }

    /// Source already listed in the copy log
    pub fn is_logged(&self, source: &Path) -> bool {
        self.snapshot.is_logged(source)
    }

    /// Whether store writes have been abandoned for this run
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Record a finished copy in the store and the copy log
    pub fn record_copied(&self, file_id: &str, content_id: &str, source: &Path) {
        if let Some(store) = self.writable_store() {
            if let Err(e) = store.mark_copied(file_id, content_id) {
                self.degrade(&e);
            }
        }

        if let Some(log) = &self.copy_log {
            if let Err(e) = log.append(source) {
                tracing::warn!("Failed to append {} to copy log: {}", source.display(), e);
            }
        }
    }

    /// Record a blob that future runs should not retry
    pub fn record_skipped(&self, content_id: &str, reason: &str) {
        if let Some(store) = self.writable_store() {
            if let Err(e) = store.mark_skipped(content_id, reason) {
                self.degrade(&e);
            }
        }
    }

    /// Re-read the snapshot, e.g. after regenerating from the destination
    pub fn refresh(&mut self) -> Result<()> {
        self.snapshot = LedgerSnapshot::capture(
            self.store.as_ref(),
            self.copy_log.as_ref().map(|l| l.path()),
        )?;
        Ok(())
    }

    fn writable_store(&self) -> Option<&LedgerStore> {
        if self.is_degraded() {
            None
        } else {
            self.store.as_ref()
        }
    }

    fn degrade(&self, err: &RestoreError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "⚠️  Ledger write failed, continuing with copy-log tracking only: {}",
                err
            );
        }
    }
}
