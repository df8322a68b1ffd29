use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub mod config;
pub mod copy;
pub mod error;
pub mod index;
pub mod ledger;
pub mod preflight;
pub mod resolver;
pub mod summary;
pub mod transport;
pub mod verify;

// Re-export the types most callers need
pub use config::{RestoreConfig, ResumeMode, SyntheticRootConfig, TransferMode};
pub use copy::{CopyEngine, CopyProgress, Outcome, RunReport, RunStats};
pub use error::{RestoreError, Result};
pub use index::{FileRecord, MetadataIndex, PathReconstructor, SyntheticRootRule};
pub use ledger::{LedgerStore, ProgressLedger, RegenerateProgress, RegenerateReport};
pub use resolver::ContentResolver;
pub use summary::RunSummary;

/// Inputs of one restore run
#[derive(Debug, Clone)]
pub struct RestoreJob {
    /// Device index database (also holds the ledger)
    pub db_path: PathBuf,
    /// Root of the content-addressed blob store
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub config: RestoreConfig,
}

impl RestoreJob {
    pub fn new(
        db_path: impl Into<PathBuf>,
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        config: RestoreConfig,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            config,
        }
    }
}

/// Load the index, bring the ledger up to date and copy every pending record.
///
/// Only a storage fault or bad configuration fails the whole call; per-record
/// problems are reported in the returned summary.
pub fn run_restore<F>(job: &RestoreJob, cancel: Arc<AtomicBool>, on_progress: F) -> Result<RunSummary>
where
    F: Fn(CopyProgress) + Send + Sync + 'static,
{
    let config = &job.config;
    config.validate()?;

    if !job.source_root.is_dir() {
        return Err(RestoreError::Config(format!(
            "source directory not found: {}",
            job.source_root.display()
        )));
    }

    // Copy log entries are absolute source paths
    let source_root = job.source_root.canonicalize()?;
    let index = MetadataIndex::load(&job.db_path)?;
    let log_path = config.copy_log_path(&job.db_path);

    let mut ledger = if config.dry_run {
        ProgressLedger::read_only(&job.db_path, Some(&log_path))?
    } else {
        std::fs::create_dir_all(&job.dest_root)?;
        match ProgressLedger::open(&job.db_path, Some(&log_path), config.ledger_retries) {
            Err(RestoreError::Io(e)) if config.copy_log.is_none() => {
                tracing::warn!(
                    "⚠️  Cannot create copy log {}: {}; tracking progress in the ledger only",
                    log_path.display(),
                    e
                );
                ProgressLedger::open(&job.db_path, None, config.ledger_retries)?
            }
            opened => opened?,
        }
    };

    if config.resume_mode == ResumeMode::RegenerateThenRun {
        if config.dry_run {
            tracing::info!("Dry run: skipping ledger regeneration");
        } else if let Some(store) = ledger.store() {
            regenerate(store, &index, &job.dest_root, config, None)?;
            ledger.refresh()?;
        } else {
            tracing::warn!("⚠️  Ledger unavailable, cannot regenerate from destination");
        }
    }

    let mut engine = CopyEngine::new(
        &index,
        &ledger,
        &source_root,
        &job.dest_root,
        config.clone(),
    )
    .with_cancel_flag(cancel);
    engine.set_progress_callback(on_progress);

    let report = engine.run()?;
    Ok(RunSummary::reconcile(&report, &index, &ledger, &job.dest_root))
}

/// Rescan `dest_root` into the ledger of `db_path`
pub fn regenerate_ledger(
    db_path: &Path,
    dest_root: &Path,
    config: &RestoreConfig,
    progress: Option<&dyn Fn(RegenerateProgress)>,
) -> Result<RegenerateReport> {
    let index = MetadataIndex::load(db_path)?;
    let store = LedgerStore::open(db_path)?.with_retries(config.ledger_retries);
    regenerate(&store, &index, dest_root, config, progress)
}

fn regenerate(
    store: &LedgerStore,
    index: &MetadataIndex,
    dest_root: &Path,
    config: &RestoreConfig,
    progress: Option<&dyn Fn(RegenerateProgress)>,
) -> Result<RegenerateReport> {
    let rule = config.synthetic_root.rule();
    let reconstructor =
        PathReconstructor::new(index, &*rule).with_sanitize_pipes(config.sanitize_pipes);
    ledger::regenerate_from_destination(store, &reconstructor, dest_root, progress)
}
