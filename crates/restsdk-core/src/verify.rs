//! Destination verification against the source blobs
//!
//! Every ledger "copied" row is checked by size and, optionally, by a
//! SHA-256 digest of both sides.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::index::PathReconstructor;
use crate::ledger::{CopiedEntry, LedgerStore};
use crate::resolver::ContentResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyStatus {
    Match,
    SizeMismatch { source: u64, dest: u64 },
    DigestMismatch,
    MissingDestination,
    MissingSource,
    /// No index record or path for the ledger row
    Unresolvable,
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyIssue {
    pub file_id: String,
    pub content_id: String,
    pub destination: Option<PathBuf>,
    pub status: VerifyStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub checked: u64,
    pub matching: u64,
    pub mismatched: u64,
    pub missing: u64,
    pub errors: u64,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// SHA-256 of a file as lowercase hex
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_copies(
    store: &LedgerStore,
    reconstructor: &PathReconstructor<'_>,
    resolver: &ContentResolver,
    dest_root: &Path,
    checksum: bool,
) -> Result<VerifyReport> {
    let entries = store.copied_entries()?;
    tracing::info!(
        "🔎 Verifying {} copied files{}",
        entries.len(),
        if checksum { " with SHA-256" } else { "" }
    );

    let results: Vec<(VerifyStatus, &CopiedEntry, Option<PathBuf>)> = entries
        .par_iter()
        .map(|entry| {
            let (status, dest) = verify_entry(entry, reconstructor, resolver, dest_root, checksum);
            (status, entry, dest)
        })
        .collect();

    let mut report = VerifyReport::default();
    for (status, entry, destination) in results {
        report.checked += 1;
        match &status {
            VerifyStatus::Match => {
                report.matching += 1;
                continue;
            }
            VerifyStatus::SizeMismatch { .. } | VerifyStatus::DigestMismatch => report.mismatched += 1,
            VerifyStatus::MissingDestination | VerifyStatus::MissingSource => report.missing += 1,
            VerifyStatus::Unresolvable | VerifyStatus::Error(_) => report.errors += 1,
        }
        tracing::warn!("Verification issue for {}: {:?}", entry.content_id, status);
        report.issues.push(VerifyIssue {
            file_id: entry.file_id.clone(),
            content_id: entry.content_id.clone(),
            destination,
            status,
        });
    }

    tracing::info!(
        "✅ Verification: {} matching, {} mismatched, {} missing, {} errors",
        report.matching,
        report.mismatched,
        report.missing,
        report.errors
    );
    Ok(report)
}

fn verify_entry(
    entry: &CopiedEntry,
    reconstructor: &PathReconstructor<'_>,
    resolver: &ContentResolver,
    dest_root: &Path,
    checksum: bool,
) -> (VerifyStatus, Option<PathBuf>) {
    let index = reconstructor.index();
    let Some(record) = index
        .get(&entry.file_id)
        .or_else(|| index.by_content_id(&entry.content_id))
    else {
        return (VerifyStatus::Unresolvable, None);
    };

    let relative = match reconstructor.reconstruct(&record.id) {
        Ok(Some(relative)) => relative,
        _ => return (VerifyStatus::Unresolvable, None),
    };
    let dest = dest_root.join(relative);

    let Some(source) = resolver.resolve(&entry.content_id) else {
        return (VerifyStatus::MissingSource, Some(dest));
    };

    let dest_size = match fs::metadata(&dest) {
        Ok(metadata) => metadata.len(),
        Err(_) => return (VerifyStatus::MissingDestination, Some(dest)),
    };
    let source_size = match fs::metadata(&source) {
        Ok(metadata) => metadata.len(),
        Err(e) => return (VerifyStatus::Error(e.to_string()), Some(dest)),
    };

    if source_size != dest_size {
        return (
            VerifyStatus::SizeMismatch {
                source: source_size,
                dest: dest_size,
            },
            Some(dest),
        );
    }

    if checksum {
        match (sha256_file(&source), sha256_file(&dest)) {
            (Ok(a), Ok(b)) if a == b => {}
            (Ok(_), Ok(_)) => return (VerifyStatus::DigestMismatch, Some(dest)),
            (Err(e), _) | (_, Err(e)) => return (VerifyStatus::Error(e.to_string()), Some(dest)),
        }
    }

    (VerifyStatus::Match, Some(dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FileRecord, MetadataIndex, NoSyntheticRoot};
    use rusqlite::Connection;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt");
        fs::write(&path, b"hello world").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_copies() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("index.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE files (id TEXT, parentID TEXT, contentID TEXT, name TEXT)")
            .unwrap();
        let store = LedgerStore::open(&db_path).unwrap();

        let index = MetadataIndex::from_records(vec![
            FileRecord::directory("1", None, "lib"),
            FileRecord::file("2", Some("1"), "good.txt", "c2"),
            FileRecord::file("3", Some("1"), "short.txt", "c3"),
            FileRecord::file("4", Some("1"), "flipped.txt", "c4"),
            FileRecord::file("5", Some("1"), "gone.txt", "c5"),
        ]);
        let reconstructor = PathReconstructor::new(&index, &NoSyntheticRoot);

        let source = temp_dir.path().join("files");
        fs::create_dir_all(&source).unwrap();
        for cid in ["c2", "c3", "c4", "c5"] {
            fs::write(source.join(cid), b"content").unwrap();
        }

        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(dest.join("lib")).unwrap();
        fs::write(dest.join("lib/good.txt"), b"content").unwrap();
        fs::write(dest.join("lib/short.txt"), b"cont").unwrap();
        fs::write(dest.join("lib/flipped.txt"), b"CONTENT").unwrap();

        for (id, cid) in [("2", "c2"), ("3", "c3"), ("4", "c4"), ("5", "c5")] {
            store.mark_copied(id, cid).unwrap();
        }
        let resolver = ContentResolver::new(&source);

        let by_size = verify_copies(&store, &reconstructor, &resolver, &dest, false).unwrap();
        assert_eq!(by_size.checked, 4);
        assert_eq!(by_size.matching, 2);
        assert_eq!(by_size.mismatched, 1);
        assert_eq!(by_size.missing, 1);

        let by_digest = verify_copies(&store, &reconstructor, &resolver, &dest, true).unwrap();
        assert_eq!(by_digest.matching, 1);
        assert_eq!(by_digest.mismatched, 2);
        assert!(by_digest
            .issues
            .iter()
            .any(|i| i.content_id == "c4" && i.status == VerifyStatus::DigestMismatch));
    }
}
