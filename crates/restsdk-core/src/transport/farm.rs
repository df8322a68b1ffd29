//! Symlink farm: the reconstructed tree as links into the blob store
//!
//! An external transfer tool pointed at the farm (following links)
//! materializes real files with its own checksumming and resume support.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::copy::engine::make_symlink;
use crate::error::{RestoreError, Result};
use crate::index::PathReconstructor;
use crate::resolver::ContentResolver;

const PROGRESS_EVERY: u64 = 50_000;

#[derive(Debug, Clone, Default)]
pub struct FarmOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmStats {
    pub created: u64,
    /// Record had no usable path
    pub skipped_no_content: u64,
    pub skipped_no_source: u64,
    /// A regular file already occupies the link path
    pub skipped_existing: u64,
    pub errors: u64,
}

/// Create one link per resolvable file record under `farm_root`.
///
/// Existing links are replaced so the farm always points at the current
/// blob; regular files are never overwritten.
pub fn build_symlink_farm(
    reconstructor: &PathReconstructor<'_>,
    resolver: &ContentResolver,
    farm_root: &Path,
    options: &FarmOptions,
) -> Result<FarmStats> {
    tracing::info!(
        "🔗 Building symlink farm in {}{}",
        farm_root.display(),
        if options.dry_run { " (dry run)" } else { "" }
    );

    if !options.dry_run {
        fs::create_dir_all(farm_root)?;
    }

    let mut stats = FarmStats::default();
    let mut seen = 0u64;

    for record in reconstructor.index().files() {
        seen += 1;
        if seen % PROGRESS_EVERY == 0 {
            tracing::info!("Farm progress: {} records, {} links", seen, stats.created);
        }

        let relative = match reconstructor.reconstruct(&record.id) {
            Ok(Some(relative)) => relative,
            Ok(None) => {
                stats.skipped_no_content += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!("⚠️  Record {} is unresolvable: {}", record.id, e);
                stats.skipped_no_content += 1;
                continue;
            }
        };

        let Some(source) = record.content_id.as_deref().and_then(|c| resolver.resolve(c)) else {
            stats.skipped_no_source += 1;
            continue;
        };

        let link = farm_root.join(&relative);
        if options.dry_run {
            tracing::debug!("Would link {} -> {}", link.display(), source.display());
            stats.created += 1;
            continue;
        }

        match place_link(&source, &link) {
            Ok(true) => stats.created += 1,
            Ok(false) => stats.skipped_existing += 1,
            Err(e) => {
                tracing::warn!("❌ {}", e);
                stats.errors += 1;
            }
        }
    }

    tracing::info!(
        "✅ Farm complete: {} links, {} without path, {} without source, {} existing files, {} errors",
        stats.created,
        stats.skipped_no_content,
        stats.skipped_no_source,
        stats.skipped_existing,
        stats.errors
    );
    Ok(stats)
}

/// Returns false when a non-link file is in the way
fn place_link(source: &Path, link: &Path) -> Result<bool> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(|e| RestoreError::transfer(parent, e))?;
    }

    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(link).map_err(|e| RestoreError::transfer(link, e))?;
        }
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(RestoreError::transfer(link, e)),
    }

    make_symlink(source, link).map_err(|e| RestoreError::transfer(link, e))?;
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::index::{FileRecord, MetadataIndex, MarkerPipeRule};
    use tempfile::TempDir;

    fn index() -> MetadataIndex {
        MetadataIndex::from_records(vec![
            FileRecord::directory("0", None, "auth|xyz"),
            FileRecord::directory("1", Some("0"), "lib"),
            FileRecord::file("2", Some("1"), "a|b.jpg", "abc123"),
            FileRecord::file("3", Some("1"), "notes.txt", "bcd234"),
            FileRecord::file("4", Some("1"), "lost.mov", "cde345"),
        ])
    }

    fn source(dir: &Path) -> ContentResolver {
        let root = dir.join("files");
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a/abc123"), b"photo").unwrap();
        fs::write(root.join("b/bcd234"), b"notes").unwrap();
        ContentResolver::new(root)
    }

    #[test]
    fn test_build_farm() {
        let temp_dir = TempDir::new().unwrap();
        let index = index();
        let reconstructor =
            PathReconstructor::new(&index, &MarkerPipeRule::default()).with_sanitize_pipes(true);
        let resolver = source(temp_dir.path());
        let farm = temp_dir.path().join("farm");

        let stats =
            build_symlink_farm(&reconstructor, &resolver, &farm, &FarmOptions::default()).unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.skipped_no_source, 1);
        assert_eq!(fs::read(farm.join("lib/a-b.jpg")).unwrap(), b"photo");

        // Rebuilding replaces links instead of failing
        let again =
            build_symlink_farm(&reconstructor, &resolver, &farm, &FarmOptions::default()).unwrap();
        assert_eq!(again.created, 2);
        assert_eq!(again.errors, 0);
    }

    #[test]
    fn test_regular_files_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        let index = index();
        let reconstructor = PathReconstructor::new(&index, &MarkerPipeRule::default());
        let resolver = source(temp_dir.path());
        let farm = temp_dir.path().join("farm");
        fs::create_dir_all(farm.join("lib")).unwrap();
        fs::write(farm.join("lib/notes.txt"), b"mine").unwrap();

        let stats =
            build_symlink_farm(&reconstructor, &resolver, &farm, &FarmOptions::default()).unwrap();
        assert_eq!(stats.skipped_existing, 1);
        assert_eq!(fs::read(farm.join("lib/notes.txt")).unwrap(), b"mine");
    }

    #[test]
    fn test_dry_run_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let index = index();
        let reconstructor = PathReconstructor::new(&index, &MarkerPipeRule::default());
        let resolver = source(temp_dir.path());
        let farm = temp_dir.path().join("farm");

        let stats =
            build_symlink_farm(&reconstructor, &resolver, &farm, &FarmOptions { dry_run: true })
                .unwrap();
        assert_eq!(stats.created, 2);
        assert!(!farm.exists());
    }
}
