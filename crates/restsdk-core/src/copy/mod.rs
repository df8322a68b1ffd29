pub mod engine;
pub mod timestamps;

pub use engine::{CopyEngine, CopyProgress, FailedRecord, Outcome, RunCounters, RunReport, RunStats};
pub use timestamps::{apply_record_mtime, sync_mtimes, MtimeReport};

/// Suffix of in-flight copies; renamed away once complete
pub const PARTIAL_SUFFIX: &str = ".restsdk-partial";
