//! End-of-run reconciliation
//!
//! Four independently derived counts are put side by side: index file
//! records, ledger copied rows, ledger skipped rows and files actually in the
//! destination. Disagreements become warnings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::copy::{FailedRecord, RunReport, RunStats, PARTIAL_SUFFIX};
use crate::error::Result;
use crate::index::MetadataIndex;
use crate::ledger::ProgressLedger;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub dry_run: bool,
    pub cancelled: bool,
    pub index_total: u64,
    /// `None` when the ledger store could not be read
    pub ledger_copied: Option<u64>,
    pub ledger_skipped: Option<u64>,
    pub destination_files: u64,
    pub stats: RunStats,
    pub skip_reasons: BTreeMap<String, u64>,
    pub failures: Vec<FailedRecord>,
    pub ledger_degraded: bool,
    /// Processed count differs from the index total
    pub incomplete: bool,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn reconcile(
        report: &RunReport,
        index: &MetadataIndex,
        ledger: &ProgressLedger,
        dest_root: &Path,
    ) -> Self {
        let index_total = index.file_count() as u64;
        let (ledger_copied, ledger_skipped) = match ledger.store() {
            Some(store) => (store.copied_count().ok(), store.skipped_count().ok()),
            None => (None, None),
        };
        let destination_files = count_destination_files(dest_root);

        let mut warnings = Vec::new();
        let incomplete = report.stats.processed != index_total;
        if incomplete {
            warnings.push(format!(
                "incomplete run: processed {} of {} file records",
                report.stats.processed, index_total
            ));
        }
        if report.stats.errored > 0 {
            warnings.push(format!(
                "{} records failed and will be retried on the next run",
                report.stats.errored
            ));
        }
        if ledger.is_degraded() {
            warnings.push("ledger writes failed; progress was tracked in the copy log only".to_string());
        }
        if let Some(copied) = ledger_copied {
            if !report.dry_run && destination_files < copied {
                warnings.push(format!(
                    "destination holds {} files but the ledger lists {} copied",
                    destination_files, copied
                ));
            }
        }

        for warning in &warnings {
            tracing::warn!("⚠️  {}", warning);
        }

        Self {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            duration_secs: (report.finished_at - report.started_at)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            dry_run: report.dry_run,
            cancelled: report.cancelled,
            index_total,
            ledger_copied,
            ledger_skipped,
            destination_files,
            stats: report.stats.clone(),
            skip_reasons: report.skip_reasons.clone(),
            failures: report.failures.clone(),
            ledger_degraded: ledger.is_degraded(),
            incomplete,
            warnings,
        }
    }

    /// Zero only for a complete run without errors
    pub fn exit_code(&self) -> i32 {
        if self.stats.errored > 0 || self.cancelled {
            1
        } else {
            0
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        tracing::info!("📄 Summary written to {}", path.display());
        Ok(())
    }
}

/// Regular files and links under `dest_root`, ignoring in-flight copies
pub fn count_destination_files(dest_root: &Path) -> u64 {
    if !dest_root.is_dir() {
        return 0;
    }
    WalkDir::new(dest_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() || e.file_type().is_symlink())
        .filter(|e| !e.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX))
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn report(processed: u64, errored: u64) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            dry_run: false,
            cancelled: false,
            stats: RunStats {
                total: 2,
                processed,
                copied: processed - errored,
                errored,
                ..RunStats::default()
            },
            skip_reasons: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    fn index() -> MetadataIndex {
        use crate::index::FileRecord;
        MetadataIndex::from_records(vec![
            FileRecord::file("1", None, "a.jpg", "c1"),
            FileRecord::file("2", None, "b.jpg", "c2"),
        ])
    }

    #[test]
    fn test_count_destination_files() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("lib")).unwrap();
        fs::write(temp_dir.path().join("lib/a.jpg"), b"x").unwrap();
        fs::write(temp_dir.path().join("lib/b.jpg.restsdk-partial"), b"x").unwrap();

        assert_eq!(count_destination_files(temp_dir.path()), 1);
        assert_eq!(count_destination_files(&temp_dir.path().join("none")), 0);
    }

    #[test]
    fn test_incomplete_run_flagged() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ProgressLedger::new(None, None).unwrap();

        let summary = RunSummary::reconcile(&report(1, 0), &index(), &ledger, temp_dir.path());
        assert!(summary.incomplete);
        assert_eq!(summary.index_total, 2);
        assert_eq!(summary.ledger_copied, None);
        assert!(summary.warnings.iter().any(|w| w.contains("incomplete")));
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_errors_set_exit_code_and_export() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ProgressLedger::new(None, None).unwrap();

        let summary = RunSummary::reconcile(&report(2, 1), &index(), &ledger, temp_dir.path());
        assert!(!summary.incomplete);
        assert_eq!(summary.exit_code(), 1);

        let json_path = temp_dir.path().join("summary.json");
        summary.write_json(&json_path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(value["stats"]["errored"], 1);
        assert_eq!(value["index_total"], 2);
    }
}
