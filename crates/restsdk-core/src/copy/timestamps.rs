//! Original modification times from index metadata

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::error::Result;
use crate::index::{FileRecord, PathReconstructor};
use crate::ledger::LedgerStore;

/// Convert epoch milliseconds, including pre-1970 values
pub fn file_time_from_millis(ms: i64) -> FileTime {
    let secs = ms.div_euclid(1000);
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    FileTime::from_unix_time(secs, nanos)
}

/// Set `path`'s mtime from the record's best timestamp.
///
/// Returns false when the record carries no usable timestamp.
pub fn apply_record_mtime(path: &Path, record: &FileRecord) -> io::Result<bool> {
    match record.best_timestamp_ms() {
        Some(ms) => {
            filetime::set_file_mtime(path, file_time_from_millis(ms))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Same as [`apply_record_mtime`] but for the link itself, never its target
pub fn apply_record_mtime_to_link(path: &Path, record: &FileRecord) -> io::Result<bool> {
    match record.best_timestamp_ms() {
        Some(ms) => {
            let time = file_time_from_millis(ms);
            filetime::set_symlink_file_times(path, time, time)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtimeReport {
    pub updated: u64,
    /// Already within one second of the metadata time
    pub unchanged: u64,
    pub no_timestamp: u64,
    pub not_found: u64,
    pub errors: u64,
}

/// Re-apply metadata mtimes to every file the ledger says was copied
pub fn sync_mtimes(
    store: &LedgerStore,
    reconstructor: &PathReconstructor<'_>,
    dest_root: &Path,
    dry_run: bool,
) -> Result<MtimeReport> {
    let index = reconstructor.index();
    let entries = store.copied_entries()?;
    tracing::info!("🕒 Syncing modification times for {} ledger entries", entries.len());

    let mut report = MtimeReport::default();
    for entry in entries {
        let record = index
            .get(&entry.file_id)
            .or_else(|| index.by_content_id(&entry.content_id));
        let Some(record) = record else {
            report.not_found += 1;
            continue;
        };

        let relative = match reconstructor.reconstruct(&record.id) {
            Ok(Some(relative)) => relative,
            Ok(None) => {
                report.not_found += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!("Cannot rebuild path for {}: {}", record.id, e);
                report.errors += 1;
                continue;
            }
        };

        let dest = dest_root.join(&relative);
        // Links from a symlink-mode run point into the blob store; never follow them
        let metadata = match fs::symlink_metadata(&dest) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.not_found += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!("Cannot stat {}: {}", dest.display(), e);
                report.errors += 1;
                continue;
            }
        };

        let Some(ms) = record.best_timestamp_ms() else {
            report.no_timestamp += 1;
            continue;
        };

        let wanted = file_time_from_millis(ms);
        let current = FileTime::from_last_modification_time(&metadata);
        if (current.unix_seconds() - wanted.unix_seconds()).abs() < 1 {
            report.unchanged += 1;
            continue;
        }

        if dry_run {
            tracing::debug!("Would set mtime of {} to {}", relative, wanted);
            report.updated += 1;
            continue;
        }

        let applied = if metadata.file_type().is_symlink() {
            filetime::set_symlink_file_times(&dest, wanted, wanted)
        } else {
            filetime::set_file_mtime(&dest, wanted)
        };
        match applied {
            Ok(()) => report.updated += 1,
            Err(e) => {
                tracing::warn!("Failed to set mtime on {}: {}", dest.display(), e);
                report.errors += 1;
            }
        }
    }

    tracing::info!(
        "✅ mtime sync: {} updated, {} unchanged, {} without timestamp, {} not found, {} errors",
        report.updated,
        report.unchanged,
        report.no_timestamp,
        report.not_found,
        report.errors
    );
    Ok(report)
}
