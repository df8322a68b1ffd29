use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use restsdk_core::copy::sync_mtimes;
use restsdk_core::preflight::{run_preflight, PreflightReport};
use restsdk_core::transport::{build_symlink_farm, FarmOptions, FarmStats, RsyncOptions, RsyncTransport};
use restsdk_core::verify::verify_copies;
use restsdk_core::{
	regenerate_ledger, run_restore, ContentResolver, LedgerStore, MetadataIndex, PathReconstructor,
	RegenerateProgress, RestoreConfig, RestoreJob, ResumeMode, RunSummary, TransferMode,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "restsdk", version, about = "Restore files from a MyCloud restsdk data directory")]
struct Cli {
	/// Debug logging
	#[arg(short, long, global = true)]
	verbose: bool,
	/// TOML file with default settings
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Copy (or link) every indexed file to its original path
	Copy {
		/// Device index database (index.db)
		#[arg(long)]
		db: PathBuf,
		/// Blob store directory (files/)
		#[arg(long)]
		source: PathBuf,
		/// Destination directory
		#[arg(long)]
		dest: PathBuf,
		/// Report what would happen without writing anything
		#[arg(long)]
		dry_run: bool,
		/// Worker threads (default: derived from CPU count)
		#[arg(long)]
		threads: Option<usize>,
		/// Set modification times from index metadata
		#[arg(long)]
		preserve_mtime: bool,
		/// Create symlinks instead of copying bytes
		#[arg(long)]
		symlink: bool,
		/// Trust the existing ledger and copy log (default)
		#[arg(long, conflicts_with_all = ["regenerate", "fresh"])]
		resume: bool,
		/// Rescan the destination into the ledger before copying
		#[arg(long, conflicts_with = "fresh")]
		regenerate: bool,
		/// Ignore the copy log
		#[arg(long)]
		fresh: bool,
		/// Append-only log of copied source paths
		#[arg(long)]
		log_file: Option<PathBuf>,
		/// Replace '|' with '-' in destination paths
		#[arg(long)]
		sanitize_pipes: bool,
		/// Do not record unresolvable files in the ledger
		#[arg(long)]
		no_record_skips: bool,
		/// Write the run summary as JSON
		#[arg(long)]
		summary_json: Option<PathBuf>,
	},
	/// Rebuild the copied ledger from the destination tree
	Regenerate {
		#[arg(long)]
		db: PathBuf,
		#[arg(long)]
		dest: PathBuf,
		#[arg(long)]
		sanitize_pipes: bool,
	},
	/// Build a symlink farm mirroring the original hierarchy
	Farm {
		#[arg(long)]
		db: PathBuf,
		#[arg(long)]
		source: PathBuf,
		#[arg(long)]
		farm: PathBuf,
		#[arg(long)]
		sanitize_pipes: bool,
		#[arg(long)]
		dry_run: bool,
	},
	/// Materialize a symlink farm at the destination with rsync
	Rsync {
		#[arg(long)]
		farm: PathBuf,
		#[arg(long)]
		dest: PathBuf,
		/// Compare by size and mtime only
		#[arg(long)]
		no_checksum: bool,
		#[arg(long)]
		dry_run: bool,
		/// Delete destination files missing from the farm
		#[arg(long)]
		delete: bool,
		/// Exclude pattern (repeatable)
		#[arg(long)]
		exclude: Vec<String>,
		/// Whole-transfer retries after errors
		#[arg(long)]
		retry_count: Option<u32>,
		/// Build the farm first (needs --db and --source)
		#[arg(long)]
		build_farm: bool,
		#[arg(long)]
		db: Option<PathBuf>,
		#[arg(long)]
		source: Option<PathBuf>,
		#[arg(long)]
		sanitize_pipes: bool,
	},
	/// Check inputs and recommend a thread count
	Preflight {
		#[arg(long)]
		source: PathBuf,
		#[arg(long)]
		dest: PathBuf,
		#[arg(long)]
		db: Option<PathBuf>,
		#[arg(long)]
		farm: Option<PathBuf>,
	},
	/// Re-apply original modification times to copied files
	SyncMtime {
		#[arg(long)]
		db: PathBuf,
		#[arg(long)]
		dest: PathBuf,
		#[arg(long)]
		dry_run: bool,
	},
	/// Compare copied files with their source blobs
	Verify {
		#[arg(long)]
		db: PathBuf,
		#[arg(long)]
		source: PathBuf,
		#[arg(long)]
		dest: PathBuf,
		/// Also compare SHA-256 digests
		#[arg(long)]
		checksum: bool,
	},
	/// Show index and ledger totals
	Status {
		#[arg(long)]
		db: PathBuf,
	},
}

/// Settings file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
	restore: RestoreConfig,
	rsync: RsyncSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RsyncSection {
	program: Option<PathBuf>,
	checksum: Option<bool>,
	retry_count: Option<u32>,
	excludes: Vec<String>,
}

fn main() {
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	match run(cli) {
		Ok(code) => std::process::exit(code),
		Err(e) => {
			eprintln!("❌ {:#}", e);
			std::process::exit(1);
		}
	}
}

fn init_tracing(verbose: bool) {
	let filter = if verbose {
		EnvFilter::new("debug")
	} else {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
	};
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
	let Some(path) = path else {
		return Ok(FileConfig::default());
	};
	let text = std::fs::read_to_string(path)
		.with_context(|| format!("cannot read config {}", path.display()))?;
	let config = toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?;
	tracing::debug!("Loaded settings from {}", path.display());
	Ok(config)
}

/// First Ctrl-C stops new work; a second one exits immediately
fn install_cancel_handler() -> Result<Arc<AtomicBool>> {
	let cancel = Arc::new(AtomicBool::new(false));
	let flag = Arc::clone(&cancel);
	ctrlc::set_handler(move || {
		if flag.swap(true, Ordering::SeqCst) {
			eprintln!("\nInterrupted again, exiting.");
			std::process::exit(130);
		}
		eprintln!("\n⏹️  Stopping after in-flight files finish (Ctrl-C again to abort)...");
	})
	.context("cannot install Ctrl-C handler")?;
	Ok(cancel)
}

fn progress_bar() -> ProgressBar {
	if !atty::is(atty::Stream::Stderr) {
		return ProgressBar::hidden();
	}
	let bar = ProgressBar::new(0);
	bar.set_style(
		ProgressStyle::default_bar()
			.template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
			.unwrap_or_else(|_| ProgressStyle::default_bar())
			.progress_chars("#>-"),
	);
	bar
}

fn run(cli: Cli) -> Result<i32> {
	let file_config = load_config(cli.config.as_deref())?;

	match cli.command {
		Commands::Copy {
			db,
			source,
			dest,
			dry_run,
			threads,
			preserve_mtime,
			symlink,
			resume,
			regenerate,
			fresh,
			log_file,
			sanitize_pipes,
			no_record_skips,
			summary_json,
		} => {
			let mut config = file_config.restore;
			config.dry_run |= dry_run;
			config.preserve_mtime |= preserve_mtime;
			config.sanitize_pipes |= sanitize_pipes;
			if let Some(threads) = threads {
				config.threads = threads;
			}
			if symlink {
				config.transfer_mode = TransferMode::Symlink;
			}
			if resume {
				config.resume_mode = ResumeMode::Resume;
			} else if regenerate {
				config.resume_mode = ResumeMode::RegenerateThenRun;
			} else if fresh {
				config.resume_mode = ResumeMode::Fresh;
			}
			if let Some(log_file) = log_file {
				config.copy_log = Some(log_file);
			}
			if no_record_skips {
				config.record_skips = false;
			}

			let cancel = install_cancel_handler()?;
			let bar = progress_bar();
			let bar_handle = bar.clone();

			let job = RestoreJob::new(db, source, dest, config);
			let summary = run_restore(&job, cancel, move |progress| {
				bar_handle.set_length(progress.total);
				bar_handle.set_position(progress.processed);
				if progress.errored > 0 {
					bar_handle.set_message(format!("{} errors", progress.errored));
				}
			})
			.context("restore failed")?;
			bar.finish_and_clear();

			print_summary(&summary);
			if let Some(path) = summary_json {
				summary.write_json(&path).context("cannot write summary")?;
			}
			Ok(summary.exit_code())
		}
		Commands::Regenerate { db, dest, sanitize_pipes } => {
			let mut config = file_config.restore;
			config.sanitize_pipes |= sanitize_pipes;

			let spinner = ProgressBar::new_spinner();
			spinner.enable_steady_tick(Duration::from_millis(100));
			let on_progress: &dyn Fn(RegenerateProgress) = &|p| {
				spinner.set_message(format!("{} scanned, {} matched", p.scanned, p.matched));
			};
			let report = regenerate_ledger(&db, &dest, &config, Some(on_progress))?;
			spinner.finish_and_clear();

			println!("✅ Ledger regenerated from {}", dest.display());
			println!("📁 Files scanned:     {}", report.scanned);
			println!("🎯 Matched by path:   {}", report.matched_by_path);
			println!("🔤 Matched by name:   {}", report.matched_by_name);
			println!("❓ Unmatched:         {}", report.unmatched);
			println!("➕ New ledger rows:   {}", report.inserted);
			Ok(0)
		}
		Commands::Farm { db, source, farm, sanitize_pipes, dry_run } => {
			let stats = build_farm(
				&db,
				&source,
				&farm,
				&file_config.restore,
				sanitize_pipes,
				dry_run,
			)?;
			print_farm_stats(&stats);
			Ok(if stats.errors > 0 { 1 } else { 0 })
		}
		Commands::Rsync {
			farm,
			dest,
			no_checksum,
			dry_run,
			delete,
			exclude,
			retry_count,
			build_farm: build_first,
			db,
			source,
			sanitize_pipes,
		} => {
			if build_first {
				let (Some(db), Some(source)) = (db.as_deref(), source.as_deref()) else {
					anyhow::bail!("--build-farm needs --db and --source");
				};
				let stats = build_farm(db, source, &farm, &file_config.restore, sanitize_pipes, false)?;
				print_farm_stats(&stats);
			}

			let section = file_config.rsync;
			let mut excludes = section.excludes;
			excludes.extend(exclude);
			let options = RsyncOptions {
				program: section.program.unwrap_or_else(|| PathBuf::from("rsync")),
				checksum: !no_checksum && section.checksum.unwrap_or(true),
				dry_run,
				delete,
				excludes,
				retry_count: retry_count.or(section.retry_count).unwrap_or(3),
			};

			let cancel = install_cancel_handler()?;
			let spinner = ProgressBar::new_spinner();
			spinner.enable_steady_tick(Duration::from_millis(100));
			let handle = spinner.clone();

			let mut transport = RsyncTransport::new(options).with_cancel_flag(cancel);
			transport.set_progress_callback(move |m| {
				handle.set_message(format!(
					"{} files | {} | {}% | {}/s | ETA {}",
					m.files_transferred,
					format_bytes(m.bytes_transferred),
					m.percent,
					format_bytes(m.speed_bytes_per_sec as u64),
					m.eta
				));
			});
			let report = transport.transfer(&farm, &dest)?;
			spinner.finish_and_clear();

			println!("{} Transfer finished", if report.success() { "✅" } else { "❌" });
			println!("🔁 Attempts:          {}", report.attempts);
			println!("📁 Files transferred: {}", report.files_transferred);
			println!("💾 Data transferred:  {}", format_bytes(report.bytes_transferred));
			println!("⏱️  Duration:          {:.1}s", report.elapsed_secs);
			for error in report.errors.iter().take(20) {
				println!("   ⚠️  {}", error);
			}
			Ok(if report.success() { 0 } else { 1 })
		}
		Commands::Preflight { source, dest, db, farm } => {
			let report = run_preflight(&source, &dest, db.as_deref(), farm.as_deref());
			print_preflight(&report);
			Ok(if report.checks_passed { 0 } else { 1 })
		}
		Commands::SyncMtime { db, dest, dry_run } => {
			let config = file_config.restore;
			let index = MetadataIndex::load(&db)?;
			let store = LedgerStore::open(&db)?;
			let rule = config.synthetic_root.rule();
			let reconstructor =
				PathReconstructor::new(&index, &*rule).with_sanitize_pipes(config.sanitize_pipes);

			let report = sync_mtimes(&store, &reconstructor, &dest, dry_run)?;
			let verb = if dry_run { "Would update" } else { "Updated" };
			println!("🕒 {}:        {}", verb, report.updated);
			println!("✔️  Unchanged:      {}", report.unchanged);
			println!("❔ No timestamp:   {}", report.no_timestamp);
			println!("❓ Not found:      {}", report.not_found);
			println!("❌ Errors:         {}", report.errors);
			Ok(if report.errors > 0 { 1 } else { 0 })
		}
		Commands::Verify { db, source, dest, checksum } => {
			let config = file_config.restore;
			let index = MetadataIndex::load(&db)?;
			let store = LedgerStore::open(&db)?;
			let rule = config.synthetic_root.rule();
			let reconstructor =
				PathReconstructor::new(&index, &*rule).with_sanitize_pipes(config.sanitize_pipes);
			let resolver = ContentResolver::new(&source);

			let report = verify_copies(&store, &reconstructor, &resolver, &dest, checksum)?;
			println!("🔎 Checked:    {}", report.checked);
			println!("✅ Matching:   {}", report.matching);
			println!("⚠️  Mismatched: {}", report.mismatched);
			println!("❓ Missing:    {}", report.missing);
			println!("❌ Errors:     {}", report.errors);
			for issue in report.issues.iter().take(20) {
				println!("   {} ({}): {:?}", issue.content_id, issue.file_id, issue.status);
			}
			Ok(if report.is_clean() { 0 } else { 1 })
		}
		Commands::Status { db } => {
			let stats = LedgerStore::open(&db)?.stats()?;
			println!("📊 Index: {}", db.display());
			println!("📁 Files:       {}", stats.total_files);
			println!("📂 Directories: {}", stats.total_dirs);
			println!("✅ Copied:      {} ({:.1}%)", stats.copied_files, stats.percent_complete);
			println!("⏭️  Skipped:     {}", stats.skipped_files);
			println!("⏳ Remaining:   {}", stats.remaining);
			Ok(0)
		}
	}
}

fn build_farm(
	db: &Path,
	source: &Path,
	farm: &Path,
	config: &RestoreConfig,
	sanitize_pipes: bool,
	dry_run: bool,
) -> Result<FarmStats> {
	let index = MetadataIndex::load(db)?;
	let rule = config.synthetic_root.rule();
	let reconstructor = PathReconstructor::new(&index, &*rule)
		.with_sanitize_pipes(config.sanitize_pipes || sanitize_pipes);
	let resolver = ContentResolver::new(source);

	let stats = build_symlink_farm(&reconstructor, &resolver, farm, &FarmOptions { dry_run })?;
	Ok(stats)
}

fn print_farm_stats(stats: &FarmStats) {
	println!("🔗 Links created:         {}", stats.created);
	println!("❔ Skipped (no path):     {}", stats.skipped_no_content);
	println!("❓ Skipped (no source):   {}", stats.skipped_no_source);
	println!("📄 Skipped (real file):   {}", stats.skipped_existing);
	println!("❌ Errors:                {}", stats.errors);
}

fn print_summary(summary: &RunSummary) {
	let stats = &summary.stats;
	println!();
	println!(
		"{} Run {}{}",
		if summary.exit_code() == 0 { "✅" } else { "⚠️ " },
		summary.run_id,
		if summary.dry_run { " (dry run)" } else { "" }
	);
	println!("⏱️  Duration:           {:.1}s", summary.duration_secs);
	println!("📚 Index file records: {}", summary.index_total);
	println!("🔄 Processed:          {}", stats.processed);
	if summary.dry_run {
		println!("📝 Would copy:         {}", stats.would_copy);
	} else {
		println!("📥 Copied:             {} ({})", stats.copied, format_bytes(stats.bytes_copied));
		if stats.linked > 0 {
			println!("🔗 Linked:             {}", stats.linked);
		}
	}
	println!("⏭️  Already present:    {}", stats.skipped_already_present);
	println!("🚫 Known unrecoverable: {}", stats.skipped_duplicate);
	println!("❓ Unresolvable:       {}", stats.skipped_unresolvable);
	for (reason, count) in &summary.skip_reasons {
		println!("     {}: {}", reason, count);
	}
	println!("❌ Errors:             {}", stats.errored);
	for failure in summary.failures.iter().take(20) {
		println!("     {}: {}", failure.destination.display(), failure.error);
	}

	let ledger = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_else(|| "n/a".to_string());
	println!("📒 Ledger copied:      {}", ledger(summary.ledger_copied));
	println!("📒 Ledger skipped:     {}", ledger(summary.ledger_skipped));
	println!("💾 Destination files:  {}", summary.destination_files);
	for warning in &summary.warnings {
		println!("⚠️  {}", warning);
	}
}

fn print_preflight(report: &PreflightReport) {
	println!("🖥️  CPUs: {} | Recommended threads: {}", report.cpu_count, report.recommended_threads);
	match &report.source_stats {
		Some(s) => println!(
			"📁 Source: {} files, {} (small {}, medium {}, large {})",
			s.files,
			format_bytes(s.bytes),
			s.small,
			s.medium,
			s.large
		),
		None => println!("❌ Source not found: {}", report.source.display()),
	}
	match &report.dest_stats {
		Some(s) => println!("📂 Destination: {} files, {}", s.files, format_bytes(s.bytes)),
		None => println!("📂 Destination will be created: {}", report.dest.display()),
	}
	if let Some(disk) = &report.dest_disk {
		println!(
			"💽 Free space on {}: {} of {}",
			disk.mount_point.display(),
			format_bytes(disk.available),
			format_bytes(disk.total)
		);
	}
	println!(
		"🧠 Memory: {} available of {}",
		format_bytes(report.memory.available),
		format_bytes(report.memory.total)
	);
	if let Some(stats) = &report.index_stats {
		println!(
			"📚 Index: {} files, {} copied ({:.1}%), {} remaining",
			stats.total_files, stats.copied_files, stats.percent_complete, stats.remaining
		);
	}
	if let Some(links) = report.farm_links {
		println!("🔗 Farm links: {}", links);
	}
	match &report.rsync {
		Some(path) => println!("🔧 rsync: {}", path.display()),
		None => println!("🔧 rsync: not found"),
	}
	for warning in &report.warnings {
		println!("⚠️  {}", warning);
	}
	println!(
		"{} Pre-flight {}",
		if report.checks_passed { "✅" } else { "❌" },
		if report.checks_passed { "passed" } else { "failed" }
	);
}

fn format_bytes(bytes: u64) -> String {
	const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
	let mut value = bytes as f64;
	let mut unit = 0;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	if unit == 0 {
		format!("{} {}", bytes, UNITS[0])
	} else {
		format!("{:.2} {}", value, UNITS[unit])
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_format_bytes() {
		assert_eq!(format_bytes(512), "512 B");
		assert_eq!(format_bytes(1536), "1.50 KB");
		assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
	}

	#[test]
	fn test_config_file_sections() {
		let config: FileConfig = toml::from_str(
			r#"
			[restore]
			threads = 6
			preserve_mtime = true
			transfer_mode = "symlink"
			synthetic_root = { name = "device root" }

			[rsync]
			retry_count = 5
			excludes = ["*.tmp"]
			"#,
		)
		.unwrap();

		assert_eq!(config.restore.threads, 6);
		assert!(config.restore.preserve_mtime);
		assert_eq!(config.restore.transfer_mode, TransferMode::Symlink);
		assert_eq!(config.rsync.retry_count, Some(5));
		assert_eq!(config.rsync.excludes, vec!["*.tmp"]);
	}

	#[test]
	fn test_cli_parses_copy() {
		let cli = Cli::try_parse_from([
			"restsdk", "copy", "--db", "index.db", "--source", "files", "--dest", "out", "--dry-run",
			"--threads", "4",
		])
		.unwrap();
		assert!(matches!(cli.command, Commands::Copy { dry_run: true, threads: Some(4), .. }));
	}

	#[test]
	fn test_cli_rejects_conflicting_resume_modes() {
		let result = Cli::try_parse_from([
			"restsdk", "copy", "--db", "a", "--source", "b", "--dest", "c", "--regenerate", "--fresh",
		]);
		assert!(result.is_err());
	}
}
