//! Delegated bulk transfer: symlink farm plus an external sync tool

pub mod farm;
pub mod rsync;

pub use farm::{build_symlink_farm, FarmOptions, FarmStats};
pub use rsync::{
    find_rsync, is_error_line, parse_progress_line, ProgressLine, RsyncOptions, RsyncTransport,
    TransferMonitor, TransferReport,
};
