//! Pre-flight checks before a restore
//!
//! Verifies that the inputs exist, counts what is on both sides, checks the
//! destination has room for what is left to copy and picks a worker count
//! from the size mix of the source blobs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};
use walkdir::WalkDir;

use crate::ledger::{IndexStats, LedgerStore};
use crate::transport::find_rsync;

const SMALL_FILE: u64 = 1024 * 1024;
const LARGE_FILE: u64 = 100 * 1024 * 1024;

/// File counts and sizes of one directory tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
    /// Under 1 MiB
    pub small: u64,
    pub medium: u64,
    /// 100 MiB and over
    pub large: u64,
}

impl TreeStats {
    /// Walk `root` without following links
    pub fn collect(root: &Path) -> Self {
        let mut stats = TreeStats::default();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            stats.add(metadata.len());
        }
        stats
    }

    fn add(&mut self, size: u64) {
        self.files += 1;
        self.bytes += size;
        if size < SMALL_FILE {
            self.small += 1;
        } else if size < LARGE_FILE {
            self.medium += 1;
        } else {
            self.large += 1;
        }
    }

    pub fn mostly_small(&self) -> bool {
        self.small > self.medium + self.large
    }
}

/// Capacity of one mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpace {
    pub mount_point: PathBuf,
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
}

impl MemoryInfo {
    pub fn current() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            total: sys.total_memory(),
            available: sys.available_memory(),
        }
    }
}

/// Filesystem holding `path`, or the one it will be created on
pub fn disk_space_for(path: &Path) -> Option<DiskSpace> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let existing = absolute.ancestors().find(|p| p.exists())?;
    let resolved = existing.canonicalize().ok()?;

    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<DiskSpace> = disks
        .list()
        .iter()
        .map(|disk| DiskSpace {
            mount_point: disk.mount_point().to_path_buf(),
            total: disk.total_space(),
            available: disk.available_space(),
        })
        .collect();
    containing_mount(&mounts, &resolved).cloned()
}

/// Deepest mount point that contains `path`
fn containing_mount<'a>(mounts: &'a [DiskSpace], path: &Path) -> Option<&'a DiskSpace> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// Warning when `needed` bytes do not fit on `disk`
fn space_shortfall(disk: &DiskSpace, needed: u64) -> Option<String> {
    if disk.available >= needed {
        return None;
    }
    Some(format!(
        "not enough free space on {}: {} bytes needed, {} available",
        disk.mount_point.display(),
        needed,
        disk.available
    ))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub checks_passed: bool,
    pub warnings: Vec<String>,
    pub source_stats: Option<TreeStats>,
    /// `None` when the destination does not exist yet
    pub dest_stats: Option<TreeStats>,
    pub index_stats: Option<IndexStats>,
    /// Links currently in the symlink farm
    pub farm_links: Option<u64>,
    pub rsync: Option<PathBuf>,
    /// Filesystem the destination lives on, when it can be determined
    pub dest_disk: Option<DiskSpace>,
    pub memory: MemoryInfo,
    pub cpu_count: usize,
    pub recommended_threads: usize,
}

/// Worker count from core count and file-size mix.
///
/// Many small files favour more threads than cores; large files do not.
pub fn recommend_thread_count(cpu_count: usize, mostly_small_files: bool) -> usize {
    if mostly_small_files {
        (cpu_count * 2).clamp(4, 32)
    } else {
        cpu_count.clamp(2, 16)
    }
}

pub fn run_preflight(
    source: &Path,
    dest: &Path,
    db_path: Option<&Path>,
    farm: Option<&Path>,
) -> PreflightReport {
    tracing::info!("🔍 Running pre-flight checks");

    let cpu_count = num_cpus::get();
    let mut report = PreflightReport {
        source: source.to_path_buf(),
        dest: dest.to_path_buf(),
        checks_passed: true,
        warnings: Vec::new(),
        source_stats: None,
        dest_stats: None,
        index_stats: None,
        farm_links: None,
        rsync: find_rsync(),
        dest_disk: disk_space_for(dest),
        memory: MemoryInfo::current(),
        cpu_count,
        recommended_threads: recommend_thread_count(cpu_count, false),
    };

    if source.is_dir() {
        let stats = TreeStats::collect(source);
        tracing::info!("Source {}: {} files, {} bytes", source.display(), stats.files, stats.bytes);
        report.recommended_threads = recommend_thread_count(cpu_count, stats.mostly_small());
        report.source_stats = Some(stats);
    } else {
        tracing::error!("Source directory not found: {}", source.display());
        report.checks_passed = false;
        report
            .warnings
            .push(format!("source directory not found: {}", source.display()));
    }

    if dest.is_dir() {
        let stats = TreeStats::collect(dest);
        tracing::info!("Destination {}: {} files, {} bytes", dest.display(), stats.files, stats.bytes);
        report.dest_stats = Some(stats);
    } else {
        tracing::warn!("Destination will be created: {}", dest.display());
    }

    tracing::info!(
        "Memory: {} MiB total, {} MiB available",
        report.memory.total / (1024 * 1024),
        report.memory.available / (1024 * 1024)
    );

    // Already-restored bytes do not need room again
    let needed = match (&report.source_stats, &report.dest_stats) {
        (Some(src), Some(dst)) => src.bytes.saturating_sub(dst.bytes),
        (Some(src), None) => src.bytes,
        _ => 0,
    };
    match &report.dest_disk {
        Some(disk) => {
            tracing::info!(
                "Destination filesystem {}: {} bytes free of {}",
                disk.mount_point.display(),
                disk.available,
                disk.total
            );
            if let Some(warning) = space_shortfall(disk, needed) {
                tracing::error!("{}", warning);
                report.checks_passed = false;
                report.warnings.push(warning);
            }
        }
        None => tracing::debug!("Cannot determine free space for {}", dest.display()),
    }

    if let Some(db_path) = db_path {
        match LedgerStore::open(db_path).and_then(|store| store.stats()) {
            Ok(stats) => {
                tracing::info!(
                    "Index: {} files, {} copied ({:.1}%), {} remaining",
                    stats.total_files,
                    stats.copied_files,
                    stats.percent_complete,
                    stats.remaining
                );
                report.index_stats = Some(stats);
            }
            Err(e) => {
                tracing::error!("Index check failed: {}", e);
                report.checks_passed = false;
                report.warnings.push(format!("index unusable: {}", e));
            }
        }
    }

    if let Some(farm) = farm {
        if farm.is_dir() {
            let links = WalkDir::new(farm)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path_is_symlink())
                .count() as u64;
            tracing::info!("Existing farm with {} links", links);

            if let Some(stats) = &report.index_stats {
                // Well short of the index suggests an interrupted farm build
                if (links as f64) < stats.total_files as f64 * 0.9 {
                    report.warnings.push(format!(
                        "farm may be incomplete: {} links for {} indexed files",
                        links, stats.total_files
                    ));
                }
            }
            report.farm_links = Some(links);
        } else {
            tracing::info!("No symlink farm at {}", farm.display());
        }

        if report.rsync.is_none() {
            report.checks_passed = false;
            report.warnings.push("rsync not found on PATH".to_string());
        }
    }

    tracing::info!(
        "{} Pre-flight {}; {} CPUs, {} threads recommended",
        if report.checks_passed { "✅" } else { "❌" },
        if report.checks_passed { "passed" } else { "failed" },
        report.cpu_count,
        report.recommended_threads
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_recommend_thread_count() {
        assert_eq!(recommend_thread_count(1, true), 4);
        assert_eq!(recommend_thread_count(8, true), 16);
        assert_eq!(recommend_thread_count(64, true), 32);
        assert_eq!(recommend_thread_count(1, false), 2);
        assert_eq!(recommend_thread_count(8, false), 8);
        assert_eq!(recommend_thread_count(64, false), 16);
    }

    #[test]
    fn test_tree_stats_buckets() {
        let mut stats = TreeStats::default();
        stats.add(10);
        stats.add(SMALL_FILE);
        stats.add(LARGE_FILE);
        assert_eq!(stats.files, 3);
        assert_eq!((stats.small, stats.medium, stats.large), (1, 1, 1));
        assert!(!stats.mostly_small());
    }

    #[test]
    fn test_preflight_passes() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("files");
        fs::create_dir_all(source.join("a")).unwrap();
        fs::write(source.join("a/abc123"), b"blob").unwrap();
        fs::write(source.join("bcd234"), b"blob").unwrap();

        let db_path = temp_dir.path().join("index.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE files (id TEXT, parentID TEXT, contentID TEXT, name TEXT);
                 INSERT INTO files VALUES ('1', NULL, 'abc123', 'a.jpg');",
            )
            .unwrap();

        let report = run_preflight(&source, &temp_dir.path().join("dest"), Some(&db_path), None);
        assert!(report.checks_passed);
        assert_eq!(report.source_stats.as_ref().unwrap().files, 2);
        assert!(report.dest_stats.is_none());
        assert_eq!(report.index_stats.as_ref().unwrap().total_files, 1);
        assert!(report.recommended_threads >= 4);
    }

    #[test]
    fn test_containing_mount_prefers_deepest() {
        let disk = |mount: &str, available: u64| DiskSpace {
            mount_point: PathBuf::from(mount),
            total: 1 << 40,
            available,
        };
        let mounts = vec![disk("/", 10), disk("/mnt/backup", 20), disk("/mnt", 30)];

        let found = containing_mount(&mounts, Path::new("/mnt/backup/restore")).unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/mnt/backup"));
        assert_eq!(containing_mount(&mounts, Path::new("/home/me")).unwrap().available, 10);
        // Component-wise match, not string prefix
        assert_eq!(
            containing_mount(&mounts, Path::new("/mnt/backups")).unwrap().mount_point,
            PathBuf::from("/mnt")
        );
    }

    #[test]
    fn test_space_shortfall() {
        let disk = DiskSpace {
            mount_point: PathBuf::from("/mnt/backup"),
            total: 1000,
            available: 100,
        };
        assert!(space_shortfall(&disk, 100).is_none());
        let warning = space_shortfall(&disk, 101).unwrap();
        assert!(warning.contains("/mnt/backup"));
    }

    #[test]
    fn test_preflight_reports_destination_disk() {
        let temp_dir = TempDir::new().unwrap();
        let report = run_preflight(temp_dir.path(), &temp_dir.path().join("not/yet"), None, None);

        assert!(report.memory.total > 0);
        if let Some(disk) = &report.dest_disk {
            assert!(temp_dir.path().canonicalize().unwrap().starts_with(&disk.mount_point));
        }
    }

    #[test]
    fn test_preflight_fails_without_source() {
        let temp_dir = TempDir::new().unwrap();
        let report = run_preflight(
            &temp_dir.path().join("missing"),
            temp_dir.path(),
            Some(&temp_dir.path().join("absent.db")),
            None,
        );
        assert!(!report.checks_passed);
        assert_eq!(report.warnings.len(), 2);
    }
}
