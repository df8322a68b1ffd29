//! Error taxonomy for index loading, path reconstruction, transfers and the ledger

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RestoreError>;

#[derive(Error, Debug)]
pub enum RestoreError {
    /// The metadata index cannot be opened or lacks the expected table/columns.
    /// Fatal: nothing runs without an index.
    #[error("storage fault: {0}")]
    Storage(String),

    /// Parent-chain traversal exceeded the number of records in the index
    #[error("parent chain of record {id} exceeds {limit} hops (cycle)")]
    Cycle { id: String, limit: usize },

    /// A parent id that does not exist in the index
    #[error("record {id} references missing parent {parent}")]
    DanglingParent { id: String, parent: String },

    /// Copy, link or timestamp update failed for one destination
    #[error("transfer failed for {}: {source}", path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Ledger store unavailable after retries
    #[error("ledger fault: {0}")]
    Ledger(#[source] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// External transfer tool could not be started or exited abnormally
    #[error("transfer tool error: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    /// Per-record faults that mark a record unresolvable instead of aborting
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            RestoreError::Cycle { .. } | RestoreError::DanglingParent { .. }
        )
    }

    pub(crate) fn transfer(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RestoreError::Transfer {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_faults() {
        let cycle = RestoreError::Cycle {
            id: "7".to_string(),
            limit: 3,
        };
        assert!(cycle.is_integrity_fault());
        assert!(cycle.to_string().contains("cycle"));

        let storage = RestoreError::Storage("missing table files".to_string());
        assert!(!storage.is_integrity_fault());
    }

    #[test]
    fn test_transfer_display_includes_path() {
        let err = RestoreError::transfer(
            "/dest/lib/photo.jpg",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/dest/lib/photo.jpg"));
    }
}
