//! Append-only text log of copied sources
//!
//! One absolute source path per line. It predates the SQLite ledger and keeps
//! working when the ledger cannot be written, so a run can always resume from
//! what it actually finished.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct CopyLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl CopyLog {
    /// Open for appending, creating the file and its directory if needed
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one successfully copied source
    pub fn append(&self, source: &Path) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{}", source.display())?;
        file.flush()
    }

    /// Read every logged source path; a missing log is empty
    pub fn load_entries(path: impl AsRef<Path>) -> io::Result<HashSet<String>> {
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e),
        };

        let mut entries = HashSet::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                entries.insert(trimmed.to_string());
            }
        }
        Ok(entries)
    }
}
