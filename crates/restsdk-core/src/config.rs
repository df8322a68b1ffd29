//! Run configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RestoreError, Result};
use crate::index::{ExactNameRule, MarkerPipeRule, NoSyntheticRoot, SyntheticRootRule};

const DEFAULT_COPY_LOG_EXTENSION: &str = "copied.log";

/// How a run treats progress left by earlier runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Trust the existing ledger and copy log
    Resume,
    /// Rescan the destination into the ledger, then run
    RegenerateThenRun,
    /// Ignore the copy log; the ledger and on-disk checks still apply
    Fresh,
}

/// What is written at each destination path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Copy,
    Symlink,
}

/// Which index entry is the device's injected root folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticRootConfig {
    /// Name containing this substring and a pipe
    Marker(String),
    /// Name equal to this string
    Name(String),
    Disabled,
}

impl Default for SyntheticRootConfig {
    fn default() -> Self {
        SyntheticRootConfig::Marker("auth".to_string())
    }
}

impl SyntheticRootConfig {
    pub fn rule(&self) -> Box<dyn SyntheticRootRule> {
        match self {
            SyntheticRootConfig::Marker(marker) => Box::new(MarkerPipeRule::new(marker.clone())),
            SyntheticRootConfig::Name(name) => Box::new(ExactNameRule::new(name.clone())),
            SyntheticRootConfig::Disabled => Box::new(NoSyntheticRoot),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub dry_run: bool,
    /// Worker threads; 0 picks a count from the CPU topology
    pub threads: usize,
    pub preserve_mtime: bool,
    pub resume_mode: ResumeMode,
    pub transfer_mode: TransferMode,
    /// Record unresolvable blobs so later runs skip them
    pub record_skips: bool,
    /// Append-only log of copied sources; unset means next to the index
    pub copy_log: Option<PathBuf>,
    pub synthetic_root: SyntheticRootConfig,
    pub sanitize_pipes: bool,
    /// Seconds between progress log lines
    pub progress_interval: u64,
    pub ledger_retries: u32,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            threads: 0,
            preserve_mtime: false,
            resume_mode: ResumeMode::Resume,
            transfer_mode: TransferMode::Copy,
            record_skips: true,
            copy_log: None,
            synthetic_root: SyntheticRootConfig::default(),
            sanitize_pipes: false,
            progress_interval: 5,
            ledger_retries: 5,
        }
    }
}

impl RestoreConfig {
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_preserve_mtime(mut self, preserve: bool) -> Self {
        self.preserve_mtime = preserve;
        self
    }

    pub fn with_resume_mode(mut self, mode: ResumeMode) -> Self {
        self.resume_mode = mode;
        self
    }

    pub fn with_transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    pub fn with_record_skips(mut self, record: bool) -> Self {
        self.record_skips = record;
        self
    }

    pub fn with_copy_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.copy_log = Some(path.into());
        self
    }

    pub fn with_synthetic_root(mut self, rule: SyntheticRootConfig) -> Self {
        self.synthetic_root = rule;
        self
    }

    pub fn with_sanitize_pipes(mut self, sanitize: bool) -> Self {
        self.sanitize_pipes = sanitize;
        self
    }

    /// Thread count to actually use
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            recommended_threads()
        } else {
            self.threads
        }
    }

    /// Copy log for a run against `db_path`
    pub fn copy_log_path(&self, db_path: &Path) -> PathBuf {
        match &self.copy_log {
            Some(path) => path.clone(),
            None => db_path.with_extension(DEFAULT_COPY_LOG_EXTENSION),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        match &self.synthetic_root {
            SyntheticRootConfig::Marker(m) if m.is_empty() => {
                return Err(RestoreError::Config(
                    "synthetic root marker must not be empty".to_string(),
                ))
            }
            SyntheticRootConfig::Name(n) if n.is_empty() => {
                return Err(RestoreError::Config(
                    "synthetic root name must not be empty".to_string(),
                ))
            }
            _ => {}
        }
        if self.threads > 512 {
            return Err(RestoreError::Config(format!(
                "thread count {} is unreasonably high",
                self.threads
            )));
        }
        Ok(())
    }
}

/// Default worker count when nothing is known about the source
pub fn recommended_threads() -> usize {
    crate::preflight::recommend_thread_count(num_cpus::get(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RestoreConfig::default();
        assert!(!config.dry_run);
        assert!(config.record_skips);
        assert_eq!(config.resume_mode, ResumeMode::Resume);
        assert_eq!(config.transfer_mode, TransferMode::Copy);
        assert!(config.effective_threads() >= 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RestoreConfig::default()
            .with_dry_run(true)
            .with_threads(8)
            .with_transfer_mode(TransferMode::Symlink)
            .with_synthetic_root(SyntheticRootConfig::Disabled);

        assert!(config.dry_run);
        assert_eq!(config.effective_threads(), 8);
        assert!(!config.synthetic_root.rule().is_synthetic_root("auth|x"));
    }

    #[test]
    fn test_copy_log_defaults_next_to_index() {
        let db = Path::new("/mnt/nas/restsdk/data/db/index.db");
        assert_eq!(
            RestoreConfig::default().copy_log_path(db),
            PathBuf::from("/mnt/nas/restsdk/data/db/index.copied.log")
        );
        assert_eq!(
            RestoreConfig::default().with_copy_log("/tmp/run.log").copy_log_path(db),
            PathBuf::from("/tmp/run.log")
        );
    }

    #[test]
    fn test_empty_marker_rejected() {
        let config =
            RestoreConfig::default().with_synthetic_root(SyntheticRootConfig::Marker(String::new()));
        assert!(matches!(config.validate(), Err(RestoreError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RestoreConfig =
            serde_json::from_str(r#"{"threads": 4, "resume_mode": "regenerate_then_run"}"#).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.resume_mode, ResumeMode::RegenerateThenRun);
        assert!(config.record_skips);
        assert_eq!(config.synthetic_root, SyntheticRootConfig::Marker("auth".to_string()));
    }
}
