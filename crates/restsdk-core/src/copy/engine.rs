//! Parallel copy/link executor
//!
//! Every file record is processed independently on a dedicated rayon pool.
//! Each record ends in exactly one [`Outcome`]; per-record faults are turned
//! into outcomes and never stop sibling work.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use super::timestamps;
use super::PARTIAL_SUFFIX;
use crate::config::{RestoreConfig, ResumeMode, TransferMode};
use crate::error::{RestoreError, Result};
use crate::index::{FileRecord, MetadataIndex, PathReconstructor};
use crate::ledger::ProgressLedger;
use crate::resolver::ContentResolver;

const REASON_NO_CONTENT: &str = "record has no content id";
const REASON_NO_PATH: &str = "path unresolvable";
const REASON_CYCLE: &str = "cycle in parent chain";
const REASON_DANGLING: &str = "dangling parent reference";
const REASON_NO_SOURCE: &str = "source blob missing";

/// Result of processing one file record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Copied { bytes: u64 },
    Linked,
    /// Dry run: a transfer would have happened
    WouldCopy,
    /// Content id previously judged unrecoverable
    SkippedDuplicate,
    SkippedAlreadyPresent,
    SkippedUnresolvable(String),
    Errored(String),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Errored(_))
    }
}

/// Live counters shared by all workers
#[derive(Debug, Default)]
pub struct RunCounters {
    pub processed: AtomicU64,
    pub copied: AtomicU64,
    pub linked: AtomicU64,
    pub would_copy: AtomicU64,
    pub skipped_duplicate: AtomicU64,
    pub skipped_already_present: AtomicU64,
    pub skipped_unresolvable: AtomicU64,
    pub errored: AtomicU64,
    pub bytes_copied: AtomicU64,
}

impl RunCounters {
    pub fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Copied { bytes } => {
                self.bytes_copied.fetch_add(*bytes, Ordering::Relaxed);
                &self.copied
            }
            Outcome::Linked => &self.linked,
            Outcome::WouldCopy => &self.would_copy,
            Outcome::SkippedDuplicate => &self.skipped_duplicate,
            Outcome::SkippedAlreadyPresent => &self.skipped_already_present,
            Outcome::SkippedUnresolvable(_) => &self.skipped_unresolvable,
            Outcome::Errored(_) => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, total: u64) -> RunStats {
        RunStats {
            total,
            processed: self.processed.load(Ordering::Relaxed),
            copied: self.copied.load(Ordering::Relaxed),
            linked: self.linked.load(Ordering::Relaxed),
            would_copy: self.would_copy.load(Ordering::Relaxed),
            skipped_duplicate: self.skipped_duplicate.load(Ordering::Relaxed),
            skipped_already_present: self.skipped_already_present.load(Ordering::Relaxed),
            skipped_unresolvable: self.skipped_unresolvable.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: u64,
    pub processed: u64,
    pub copied: u64,
    pub linked: u64,
    pub would_copy: u64,
    pub skipped_duplicate: u64,
    pub skipped_already_present: u64,
    pub skipped_unresolvable: u64,
    pub errored: u64,
    pub bytes_copied: u64,
}

impl RunStats {
    pub fn skipped(&self) -> u64 {
        self.skipped_duplicate + self.skipped_already_present + self.skipped_unresolvable
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 / self.total as f64 * 100.0
        }
    }
}

/// A record that ended in `Errored`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    pub file_id: String,
    pub content_id: String,
    pub destination: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct CopyProgress {
    pub processed: u64,
    pub total: u64,
    pub copied: u64,
    pub errored: u64,
}

/// Everything a finished (or cancelled) run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub stats: RunStats,
    /// Unresolvable records grouped by reason
    pub skip_reasons: BTreeMap<String, u64>,
    pub failures: Vec<FailedRecord>,
}

impl RunReport {
    pub fn has_errors(&self) -> bool {
        self.stats.errored > 0
    }
}

pub struct CopyEngine<'a> {
    config: RestoreConfig,
    reconstructor: PathReconstructor<'a>,
    resolver: ContentResolver,
    ledger: &'a ProgressLedger,
    dest_root: PathBuf,
    counters: RunCounters,
    failures: Mutex<Vec<FailedRecord>>,
    skip_reasons: Mutex<BTreeMap<String, u64>>,
    cancel: Arc<AtomicBool>,
    progress_callback: Option<Box<dyn Fn(CopyProgress) + Send + Sync>>,
}

impl<'a> CopyEngine<'a> {
    pub fn new(
        index: &'a MetadataIndex,
        ledger: &'a ProgressLedger,
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        config: RestoreConfig,
    ) -> Self {
        let rule = config.synthetic_root.rule();
        let reconstructor =
            PathReconstructor::new(index, &*rule).with_sanitize_pipes(config.sanitize_pipes);

        Self {
            reconstructor,
            resolver: ContentResolver::new(source_root),
            ledger,
            dest_root: dest_root.into(),
            counters: RunCounters::default(),
            failures: Mutex::new(Vec::new()),
            skip_reasons: Mutex::new(BTreeMap::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            progress_callback: None,
            config,
        }
    }

    /// Share a flag that stops new records from being started
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(CopyProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn reconstructor(&self) -> &PathReconstructor<'a> {
        &self.reconstructor
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    /// Process every file record of the index on the worker pool
    pub fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let threads = self.config.effective_threads();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("restsdk-copy-{}", i))
            .build()
            .map_err(|e| RestoreError::Config(format!("cannot build worker pool: {}", e)))?;

        let records: Vec<&FileRecord> = self.reconstructor.index().files().collect();
        let total = records.len() as u64;

        tracing::info!(
            "🚀 Run {} started: {} file records, {} threads{}",
            run_id,
            total,
            threads,
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        let interval = self.config.progress_interval();
        let last_report = Mutex::new(Instant::now());

        pool.install(|| {
            records.par_iter().for_each(|record| {
                if self.cancel.load(Ordering::Relaxed) {
                    return;
                }

                let outcome = self.process(record);
                self.counters.record(&outcome);
                self.emit_progress(total);

                if let Ok(mut last) = last_report.try_lock() {
                    if last.elapsed() >= interval {
                        *last = Instant::now();
                        let stats = self.counters.snapshot(total);
                        tracing::info!(
                            "Progress: {}/{} ({:.1}%), {} copied, {} skipped, {} errors",
                            stats.processed,
                            stats.total,
                            stats.percent(),
                            stats.copied + stats.linked,
                            stats.skipped(),
                            stats.errored
                        );
                    }
                }
            });
        });

        let cancelled = self.cancel.load(Ordering::Relaxed);
        let stats = self.counters.snapshot(total);
        if cancelled {
            tracing::warn!(
                "⏹️  Run cancelled after {}/{} records; completed work is recorded",
                stats.processed,
                stats.total
            );
        }

        tracing::info!(
            "✅ Run {} finished: {} copied, {} linked, {} would copy, {} skipped, {} errors, {} bytes",
            run_id,
            stats.copied,
            stats.linked,
            stats.would_copy,
            stats.skipped(),
            stats.errored,
            stats.bytes_copied
        );

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            cancelled,
            stats,
            skip_reasons: self
                .skip_reasons
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            failures: self
                .failures
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        })
    }

    /// Decide and carry out the outcome of one record
    pub fn process(&self, record: &FileRecord) -> Outcome {
        let Some(content_id) = record.content_id.as_deref().filter(|c| !c.is_empty()) else {
            return Outcome::SkippedUnresolvable(REASON_NO_CONTENT.to_string());
        };

        if self.ledger.is_skipped(content_id) {
            return Outcome::SkippedDuplicate;
        }
        if self.ledger.is_copied(content_id) {
            return Outcome::SkippedAlreadyPresent;
        }

        let relative = match self.reconstructor.reconstruct(&record.id) {
            Ok(Some(relative)) => relative,
            Ok(None) => return self.unresolvable(record, content_id, REASON_NO_PATH),
            Err(e) => {
                tracing::warn!("⚠️  Record {} is unresolvable: {}", record.id, e);
                let reason = match e {
                    RestoreError::Cycle { .. } => REASON_CYCLE,
                    RestoreError::DanglingParent { .. } => REASON_DANGLING,
                    _ => REASON_NO_PATH,
                };
                return self.unresolvable(record, content_id, reason);
            }
        };

        let Some(source) = self.resolver.resolve(content_id) else {
            tracing::debug!("No blob for {} ({})", content_id, relative);
            return self.unresolvable(record, content_id, REASON_NO_SOURCE);
        };

        if self.config.resume_mode != ResumeMode::Fresh && self.ledger.is_logged(&source) {
            return Outcome::SkippedAlreadyPresent;
        }

        let dest = self.dest_root.join(&relative);
        if dest.symlink_metadata().is_ok() {
            if !self.config.dry_run {
                self.adopt_existing(record, content_id, &source, &dest);
            }
            return Outcome::SkippedAlreadyPresent;
        }

        if self.config.dry_run {
            tracing::debug!("Would transfer {} -> {}", source.display(), dest.display());
            return Outcome::WouldCopy;
        }

        let result = match self.config.transfer_mode {
            TransferMode::Copy => self.copy_blob(record, &source, &dest),
            TransferMode::Symlink => self.link_blob(record, &source, &dest),
        };

        match result {
            Ok(outcome) => {
                self.ledger.record_copied(&record.id, content_id, &source);
                tracing::debug!("Transferred {} -> {}", content_id, relative);
                outcome
            }
            Err(e) => {
                tracing::warn!("❌ Failed to transfer {}: {}", relative, e);
                self.failures
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(FailedRecord {
                        file_id: record.id.clone(),
                        content_id: content_id.to_string(),
                        destination: dest,
                        error: e.to_string(),
                    });
                Outcome::Errored(e.to_string())
            }
        }
    }

    fn unresolvable(&self, record: &FileRecord, content_id: &str, reason: &str) -> Outcome {
        *self
            .skip_reasons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(reason.to_string())
            .or_insert(0) += 1;

        if self.config.record_skips && !self.config.dry_run {
            self.ledger.record_skipped(content_id, reason);
        }
        tracing::debug!("Skipping record {} ({}): {}", record.id, content_id, reason);
        Outcome::SkippedUnresolvable(reason.to_string())
    }

    /// A destination file the ledger did not know about
    fn adopt_existing(&self, record: &FileRecord, content_id: &str, source: &Path, dest: &Path) {
        if self.config.preserve_mtime {
            let is_link = dest
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            let applied = if is_link {
                timestamps::apply_record_mtime_to_link(dest, record)
            } else {
                timestamps::apply_record_mtime(dest, record)
            };
            if let Err(e) = applied {
                tracing::debug!("Cannot refresh mtime on {}: {}", dest.display(), e);
            }
        }
        self.ledger.record_copied(&record.id, content_id, source);
    }

    fn copy_blob(&self, record: &FileRecord, source: &Path, dest: &Path) -> Result<Outcome> {
        create_parent(dest)?;

        let partial = partial_path(dest);
        let bytes = match fs::copy(source, &partial) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(RestoreError::transfer(source, e));
            }
        };

        if self.config.preserve_mtime {
            if let Err(e) = timestamps::apply_record_mtime(&partial, record) {
                let _ = fs::remove_file(&partial);
                return Err(RestoreError::transfer(dest, e));
            }
        }

        if let Err(e) = fs::rename(&partial, dest) {
            let _ = fs::remove_file(&partial);
            return Err(RestoreError::transfer(dest, e));
        }

        Ok(Outcome::Copied { bytes })
    }

    fn link_blob(&self, record: &FileRecord, source: &Path, dest: &Path) -> Result<Outcome> {
        create_parent(dest)?;
        make_symlink(source, dest).map_err(|e| RestoreError::transfer(dest, e))?;

        if self.config.preserve_mtime {
            timestamps::apply_record_mtime_to_link(dest, record)
                .map_err(|e| RestoreError::transfer(dest, e))?;
        }
        Ok(Outcome::Linked)
    }

    fn emit_progress(&self, total: u64) {
        if let Some(callback) = &self.progress_callback {
            callback(CopyProgress {
                processed: self.counters.processed.load(Ordering::Relaxed),
                total,
                copied: self.counters.copied.load(Ordering::Relaxed)
                    + self.counters.linked.load(Ordering::Relaxed),
                errored: self.counters.errored.load(Ordering::Relaxed),
            });
        }
    }
}

fn create_parent(dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| RestoreError::transfer(parent, e))?;
    }
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[cfg(unix)]
pub(crate) fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub(crate) fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerStore;
    use rusqlite::Connection;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        db_path: PathBuf,
        source: PathBuf,
        dest: PathBuf,
        index: MetadataIndex,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("index.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE files (id TEXT, parentID TEXT, contentID TEXT, name TEXT)")
            .unwrap();

        let source = temp_dir.path().join("files");
        fs::create_dir_all(source.join("a")).unwrap();
        fs::write(source.join("a").join("abc123"), b"photo bytes").unwrap();
        fs::write(source.join("bcd234"), b"notes").unwrap();

        let mut photo = FileRecord::file("3", Some("2"), "photo.jpg", "abc123");
        photo.image_date = Some(1_500_000_000_000);
        photo.video_date = Some(1_600_000_000_000);

        let index = MetadataIndex::from_records(vec![
            FileRecord::directory("0", None, "auth|xyz"),
            FileRecord::directory("1", Some("0"), "lib"),
            FileRecord::directory("2", Some("1"), "2019"),
            photo,
            FileRecord::file("4", Some("1"), "notes.txt", "bcd234"),
            FileRecord::file("5", Some("1"), "lost.mov", "cde345"),
            FileRecord::file("6", Some("7"), "orphan.jpg", "def456"),
        ]);

        Fixture {
            dest: temp_dir.path().join("dest"),
            db_path,
            source,
            index,
            _temp_dir: temp_dir,
        }
    }

    fn config() -> RestoreConfig {
        RestoreConfig::default().with_threads(2).with_preserve_mtime(true)
    }

    #[test]
    fn test_run_copies_resolvable_records() {
        let f = fixture();
        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let engine = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config());

        let report = engine.run().unwrap();
        assert_eq!(report.stats.total, 4);
        assert_eq!(report.stats.copied, 2);
        assert_eq!(report.stats.skipped_unresolvable, 2);
        assert_eq!(report.stats.bytes_copied, 16);
        assert_eq!(report.skip_reasons.get(REASON_NO_SOURCE), Some(&1));
        assert_eq!(report.skip_reasons.get(REASON_DANGLING), Some(&1));
        assert!(!report.has_errors());

        assert_eq!(fs::read(f.dest.join("lib/2019/photo.jpg")).unwrap(), b"photo bytes");
        assert_eq!(fs::read(f.dest.join("lib/notes.txt")).unwrap(), b"notes");
        assert!(!f.dest.join("lib/2019/photo.jpg.restsdk-partial").exists());

        let store = LedgerStore::open(&f.db_path).unwrap();
        assert_eq!(store.copied_count().unwrap(), 2);
        assert_eq!(store.skipped_count().unwrap(), 2);
    }

    #[test]
    fn test_image_date_wins_for_mtime() {
        let f = fixture();
        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config())
            .run()
            .unwrap();

        let metadata = fs::metadata(f.dest.join("lib/2019/photo.jpg")).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&metadata);
        assert_eq!(mtime.unix_seconds(), 1_500_000_000);
    }

    #[test]
    fn test_process_order_of_checks() {
        let f = fixture();
        let store = LedgerStore::open(&f.db_path).unwrap();
        store.mark_skipped("abc123", "earlier run").unwrap();
        store.mark_copied("4", "bcd234").unwrap();

        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let engine = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config());

        assert_eq!(engine.process(f.index.get("3").unwrap()), Outcome::SkippedDuplicate);
        assert_eq!(engine.process(f.index.get("4").unwrap()), Outcome::SkippedAlreadyPresent);
        assert!(matches!(
            engine.process(f.index.get("5").unwrap()),
            Outcome::SkippedUnresolvable(_)
        ));
    }

    #[test]
    fn test_existing_destination_is_adopted() {
        let f = fixture();
        fs::create_dir_all(f.dest.join("lib")).unwrap();
        fs::write(f.dest.join("lib/notes.txt"), b"already here").unwrap();

        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let engine = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config());

        assert_eq!(engine.process(f.index.get("4").unwrap()), Outcome::SkippedAlreadyPresent);
        assert_eq!(fs::read(f.dest.join("lib/notes.txt")).unwrap(), b"already here");
        assert!(ledger.store().unwrap().copied_content_ids().unwrap().contains("bcd234"));
    }

    #[test]
    fn test_transfer_fault_does_not_abort_run() {
        let f = fixture();
        // A regular file where a directory is needed
        fs::create_dir_all(&f.dest).unwrap();
        fs::write(f.dest.join("lib"), b"blocker").unwrap();

        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let report = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config())
            .run()
            .unwrap();

        assert_eq!(report.stats.errored, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.stats.processed, 4);
        assert!(report.has_errors());
        // Errored records stay out of the ledger
        assert_eq!(ledger.store().unwrap().copied_count().unwrap(), 0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let f = fixture();
        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let report = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config())
            .with_cancel_flag(cancel)
            .run()
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.stats.processed, 0);
        assert!(!f.dest.exists());
    }

    #[test]
    fn test_cancel_mid_run_keeps_finished_work() {
        let f = fixture();
        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let trigger = Arc::clone(&cancel);

        let mut engine = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config().with_threads(1))
            .with_cancel_flag(Arc::clone(&cancel));
        engine.set_progress_callback(move |_| trigger.store(true, Ordering::SeqCst));
        let report = engine.run().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.stats.processed, 1);
        let store = ledger.store().unwrap();
        assert_eq!(store.copied_count().unwrap() + store.skipped_count().unwrap(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_adopting_a_link_leaves_its_target_alone() {
        let f = fixture();
        let blob = f.source.join("bcd234");
        let blob_mtime = filetime::FileTime::from_unix_time(1_700_000_000, 0);
        filetime::set_file_mtime(&blob, blob_mtime).unwrap();

        let mut record = FileRecord::file("4", Some("1"), "notes.txt", "bcd234");
        record.creation_time = Some(1_000_000_000_000);
        let index = MetadataIndex::from_records(vec![
            FileRecord::directory("0", None, "auth|xyz"),
            FileRecord::directory("1", Some("0"), "lib"),
            record,
        ]);
        fs::create_dir_all(f.dest.join("lib")).unwrap();
        std::os::unix::fs::symlink(&blob, f.dest.join("lib/notes.txt")).unwrap();

        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let engine = CopyEngine::new(&index, &ledger, &f.source, &f.dest, config());
        assert_eq!(engine.process(index.get("4").unwrap()), Outcome::SkippedAlreadyPresent);

        let after = filetime::FileTime::from_last_modification_time(&fs::metadata(&blob).unwrap());
        assert_eq!(after, blob_mtime);
    }

    #[test]
    fn test_copy_log_short_circuits() {
        let f = fixture();
        let log_path = f.db_path.with_file_name("copied.log");
        fs::write(
            &log_path,
            format!("{}\n", f.source.join("bcd234").display()),
        )
        .unwrap();

        let ledger = ProgressLedger::open(&f.db_path, Some(&log_path), 3).unwrap();
        let engine = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config());
        assert_eq!(engine.process(f.index.get("4").unwrap()), Outcome::SkippedAlreadyPresent);

        let fresh = config().with_resume_mode(ResumeMode::Fresh);
        let engine = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, fresh);
        assert!(matches!(
            engine.process(f.index.get("4").unwrap()),
            Outcome::Copied { bytes: 5 }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_mode() {
        let f = fixture();
        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let config = config().with_transfer_mode(TransferMode::Symlink);
        let report = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config)
            .run()
            .unwrap();

        assert_eq!(report.stats.linked, 2);
        let link = f.dest.join("lib/notes.txt");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), f.source.join("bcd234"));
    }

    #[test]
    fn test_progress_callback_sees_every_record() {
        let f = fixture();
        let ledger = ProgressLedger::open(&f.db_path, None, 3).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);

        let mut engine = CopyEngine::new(&f.index, &ledger, &f.source, &f.dest, config());
        engine.set_progress_callback(move |progress| {
            assert_eq!(progress.total, 4);
            seen_clone.fetch_add(1, Ordering::Relaxed);
        });
        engine.run().unwrap();

        assert_eq!(seen.load(Ordering::Relaxed), 4);
    }
}
