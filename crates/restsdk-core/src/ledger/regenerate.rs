//! Rebuild the copied ledger from what is actually in the destination
//!
//! Each destination file is matched first by its full relative path against
//! the reconstructed path of every index record, then by bare file name when
//! that name belongs to exactly one record.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

use super::database::LedgerStore;
use crate::copy::PARTIAL_SUFFIX;
use crate::error::{RestoreError, Result};
use crate::index::PathReconstructor;

const PROGRESS_EVERY: u64 = 10_000;
const FLUSH_EVERY: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegenerateReport {
    pub scanned: u64,
    pub matched_by_path: u64,
    pub matched_by_name: u64,
    pub unmatched: u64,
    /// Rows that were not already in the ledger
    pub inserted: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RegenerateProgress {
    pub scanned: u64,
    pub matched: u64,
}

/// Walk `dest_root` and insert a copied row for every recognised file
pub fn regenerate_from_destination(
    store: &LedgerStore,
    reconstructor: &PathReconstructor<'_>,
    dest_root: &Path,
    progress: Option<&dyn Fn(RegenerateProgress)>,
) -> Result<RegenerateReport> {
    scan_destination(store, reconstructor, dest_root, PROGRESS_EVERY, progress)
}

/// Same as [`regenerate_from_destination`], reporting every `progress_every` files
pub fn scan_destination(
    store: &LedgerStore,
    reconstructor: &PathReconstructor<'_>,
    dest_root: &Path,
    progress_every: u64,
    progress: Option<&dyn Fn(RegenerateProgress)>,
) -> Result<RegenerateReport> {
    let progress_every = progress_every.max(1);
    if !dest_root.is_dir() {
        return Err(RestoreError::Config(format!(
            "destination is not a directory: {}",
            dest_root.display()
        )));
    }

    tracing::info!("🔄 Regenerating ledger from {}", dest_root.display());
    let (by_path, by_name) = build_lookup(reconstructor);

    let mut report = RegenerateReport::default();
    let mut pending: Vec<(String, String)> = Vec::with_capacity(FLUSH_EVERY);

    for entry in WalkDir::new(dest_root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Cannot read destination entry: {}", e);
                continue;
            }
        };

        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_symlink()) {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        if file_name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }

        report.scanned += 1;

        let relative = entry
            .path()
            .strip_prefix(dest_root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();

        let matched = if let Some(ids) = by_path.get(relative.as_str()) {
            report.matched_by_path += 1;
            Some(ids)
        } else if let Some(Some(ids)) = by_name.get(&*file_name) {
            report.matched_by_name += 1;
            Some(ids)
        } else {
            report.unmatched += 1;
            tracing::debug!("No index record for {}", relative);
            None
        };

        if let Some((file_id, content_id)) = matched {
            pending.push((file_id.clone(), content_id.clone()));
            if pending.len() >= FLUSH_EVERY {
                report.inserted += store.mark_copied_batch(&pending)? as u64;
                pending.clear();
            }
        }

        if report.scanned % progress_every == 0 {
            let matched = report.matched_by_path + report.matched_by_name;
            tracing::info!("Scanned {} files, matched {}", report.scanned, matched);
            if let Some(callback) = progress {
                callback(RegenerateProgress {
                    scanned: report.scanned,
                    matched,
                });
            }
        }
    }

    if !pending.is_empty() {
        report.inserted += store.mark_copied_batch(&pending)? as u64;
    }

    tracing::info!(
        "✅ Regeneration complete: {} scanned, {} by path, {} by name, {} unmatched, {} new ledger rows",
        report.scanned,
        report.matched_by_path,
        report.matched_by_name,
        report.unmatched,
        report.inserted
    );
    Ok(report)
}

type Ids = (String, String);

/// Relative path → ids, and file name → ids when the name is unique
fn build_lookup(reconstructor: &PathReconstructor<'_>) -> (HashMap<String, Ids>, HashMap<String, Option<Ids>>) {
    let index = reconstructor.index();
    let mut by_path = HashMap::with_capacity(index.file_count());
    let mut by_name: HashMap<String, Option<Ids>> = HashMap::with_capacity(index.file_count());

    for record in index.files() {
        let Some(content_id) = record.content_id.clone() else {
            continue;
        };
        let ids = (record.id.clone(), content_id);

        by_name
            .entry(reconstructor.file_name(record))
            .and_modify(|slot| *slot = None)
            .or_insert_with(|| Some(ids.clone()));

        match reconstructor.reconstruct(&record.id) {
            Ok(Some(path)) => {
                by_path.insert(path, ids);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Skipping {} during regeneration: {}", record.id, e),
        }
    }

    (by_path, by_name)
}
