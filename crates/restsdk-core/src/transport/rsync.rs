//! Bulk transfer through an external `rsync`
//!
//! The farm directory is handed to `rsync -L` so links are materialized as
//! real files. Progress comes from `--info=progress2`, which rewrites its
//! status line with carriage returns, so output is split on both `\r` and
//! `\n`. Any output line mentioning an error or failure marks the attempt as
//! failed and the whole transfer is retried.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{RestoreError, Result};

static PROGRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([\d,]+)\s+(\d+)%\s+([\d.]+)([KMG]?)B/s\s+(\d+:\d+:\d+|\d+:\d+)").unwrap()
});
static XFR_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"xfr#(\d+)").unwrap());

#[derive(Debug, Clone)]
pub struct RsyncOptions {
    pub program: PathBuf,
    pub checksum: bool,
    pub dry_run: bool,
    /// Propagate deletions from the farm to the destination
    pub delete: bool,
    pub excludes: Vec<String>,
    /// Whole-transfer retries after a failed attempt
    pub retry_count: u32,
}

impl Default for RsyncOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("rsync"),
            checksum: true,
            dry_run: false,
            delete: false,
            excludes: Vec::new(),
            retry_count: 3,
        }
    }
}

/// Fields recognised in one progress line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressLine {
    pub bytes_transferred: Option<u64>,
    pub percent: Option<u8>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta: Option<String>,
    pub files_transferred: Option<u64>,
}

impl ProgressLine {
    fn is_empty(&self) -> bool {
        self.bytes_transferred.is_none() && self.files_transferred.is_none()
    }
}

/// Parse an `--info=progress2` line such as
/// `1,234,567  45%   12.34MB/s    1:23:45 (xfr#123, to-chk=456/789)`
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let mut progress = ProgressLine::default();

    if let Some(caps) = PROGRESS_REGEX.captures(line) {
        progress.bytes_transferred = caps[1].replace(',', "").parse().ok();
        progress.percent = caps[2].parse().ok();
        let multiplier = match &caps[4] {
            "K" => 1024.0,
            "M" => 1024.0 * 1024.0,
            "G" => 1024.0 * 1024.0 * 1024.0,
            _ => 1.0,
        };
        progress.speed_bytes_per_sec = caps[3].parse::<f64>().ok().map(|s| s * multiplier);
        progress.eta = Some(caps[5].to_string());
    }

    if let Some(caps) = XFR_REGEX.captures(line) {
        progress.files_transferred = caps[1].parse().ok();
    }

    if progress.is_empty() {
        None
    } else {
        Some(progress)
    }
}

/// Diagnostic from rsync, as opposed to a file name listed with `-v`
pub fn is_error_line(line: &str) -> bool {
    let trimmed = line.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("rsync:") || lower.starts_with("rsync error") || lower.starts_with("error:") {
        return true;
    }
    // Per-file failures quote the path: open "x" failed: ...
    trimmed.contains('"') && (lower.contains("failed:") || lower.contains("failed to"))
}

/// Latest known transfer state, shared with the output readers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferMonitor {
    pub bytes_transferred: u64,
    pub percent: u8,
    pub speed_bytes_per_sec: f64,
    pub eta: String,
    pub files_transferred: u64,
    pub errors: Vec<String>,
}

impl TransferMonitor {
    /// Fold one output line into the state; returns true for progress lines
    pub fn observe(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }

        if is_error_line(line) {
            tracing::warn!("rsync: {}", line);
            self.errors.push(line.to_string());
        }

        let Some(progress) = parse_progress_line(line) else {
            tracing::debug!("rsync: {}", line);
            return false;
        };

        if let Some(bytes) = progress.bytes_transferred {
            self.bytes_transferred = bytes;
        }
        if let Some(percent) = progress.percent {
            self.percent = percent;
        }
        if let Some(speed) = progress.speed_bytes_per_sec {
            self.speed_bytes_per_sec = speed;
        }
        if let Some(eta) = progress.eta {
            self.eta = eta;
        }
        if let Some(files) = progress.files_transferred {
            self.files_transferred = files;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    /// Error lines from the last attempt
    pub errors: Vec<String>,
    pub elapsed_secs: f64,
    pub cancelled: bool,
}

impl TransferReport {
    pub fn success(&self) -> bool {
        !self.cancelled && self.errors.is_empty() && self.exit_code == Some(0)
    }
}

pub struct RsyncTransport {
    options: RsyncOptions,
    cancel: Arc<AtomicBool>,
    progress_callback: Option<Box<dyn Fn(&TransferMonitor) + Send + Sync>>,
}

impl RsyncTransport {
    pub fn new(options: RsyncOptions) -> Self {
        Self {
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            progress_callback: None,
        }
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(&TransferMonitor) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Arguments for one attempt, farm contents into `dest`
    pub fn build_args(&self, farm: &Path, dest: &Path) -> Vec<String> {
        let mut args = vec!["-avL".to_string(), "--info=progress2".to_string()];
        if self.options.checksum {
            args.push("--checksum".to_string());
        }
        if self.options.dry_run {
            args.push("--dry-run".to_string());
        }
        if self.options.delete {
            args.push("--delete".to_string());
        }
        for pattern in &self.options.excludes {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }

        let mut source = farm.to_string_lossy().into_owned();
        if !source.ends_with('/') {
            source.push('/');
        }
        args.push(source);
        args.push(dest.to_string_lossy().into_owned());
        args
    }

    /// Run the transfer, retrying while attempts report errors
    pub fn transfer(&self, farm: &Path, dest: &Path) -> Result<TransferReport> {
        if !farm.is_dir() {
            return Err(RestoreError::Config(format!(
                "symlink farm not found: {}",
                farm.display()
            )));
        }

        let started = Instant::now();
        let mut attempts = 1;
        let (mut exit_code, mut monitor) = self.run_once(farm, dest)?;

        if !monitor.errors.is_empty() && !self.options.dry_run {
            while attempts <= self.options.retry_count && !self.cancelled() {
                tracing::info!(
                    "🔁 Retrying transfer ({} errors), attempt {}/{}",
                    monitor.errors.len(),
                    attempts,
                    self.options.retry_count
                );
                attempts += 1;
                (exit_code, monitor) = self.run_once(farm, dest)?;
                if monitor.errors.is_empty() {
                    tracing::info!("✅ Retry succeeded");
                    break;
                }
            }
        }

        let report = TransferReport {
            attempts,
            exit_code,
            files_transferred: monitor.files_transferred,
            bytes_transferred: monitor.bytes_transferred,
            errors: monitor.errors,
            elapsed_secs: started.elapsed().as_secs_f64(),
            cancelled: self.cancelled(),
        };

        tracing::info!(
            "Transfer finished after {} attempt(s): {} files, {} bytes, {} errors",
            report.attempts,
            report.files_transferred,
            report.bytes_transferred,
            report.errors.len()
        );
        Ok(report)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn run_once(&self, farm: &Path, dest: &Path) -> Result<(Option<i32>, TransferMonitor)> {
        let args = self.build_args(farm, dest);
        tracing::info!("Running: {} {}", self.options.program.display(), args.join(" "));

        let mut child = Command::new(&self.options.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RestoreError::Tool(format!(
                    "cannot start {}: {}",
                    self.options.program.display(),
                    e
                ))
            })?;

        let monitor = Arc::new(Mutex::new(TransferMonitor::default()));

        let stderr_reader = child.stderr.take().map(|stderr| {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || {
                for_each_line(stderr, |line| {
                    monitor.lock().unwrap_or_else(|e| e.into_inner()).observe(line);
                })
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for_each_line(stdout, |line| {
                let mut state = monitor.lock().unwrap_or_else(|e| e.into_inner());
                if state.observe(line) {
                    if let Some(callback) = &self.progress_callback {
                        callback(&*state);
                    }
                }
                if self.cancelled() {
                    let _ = child.kill();
                }
            })?;
        }

        if let Some(handle) = stderr_reader {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => tracing::warn!("rsync stderr reader panicked"),
            }
        }

        let status = child.wait()?;
        let mut monitor = monitor.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if !status.success() && !self.cancelled() && monitor.errors.is_empty() {
            monitor
                .errors
                .push(format!("rsync exited with status {}", status));
        }
        Ok((status.code(), monitor))
    }
}

/// Split a byte stream on `\r` and `\n`, lossily decoding each line
fn for_each_line<R: Read>(reader: R, mut f: impl FnMut(&str)) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut line = Vec::new();

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            if byte == b'\r' || byte == b'\n' {
                if !line.is_empty() {
                    f(&String::from_utf8_lossy(&line));
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
    }

    if !line.is_empty() {
        f(&String::from_utf8_lossy(&line));
    }
    Ok(())
}

/// Locate `rsync` on `PATH`
pub fn find_rsync() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("rsync"))
        .find(|candidate| candidate.is_file())
}
