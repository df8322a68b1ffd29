use std::collections::HashSet;
use std::path::Path;

use super::copy_log::CopyLog;
use super::database::LedgerStore;
use crate::error::Result;

/// Point-in-time membership sets read once at run start.
///
/// Workers consult these instead of querying the store per record.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub copied: HashSet<String>,
    pub skipped: HashSet<String>,
    /// Absolute source paths from the resumability log
    pub logged_sources: HashSet<String>,
}

impl LedgerSnapshot {
    /// Read the store (when available) and the copy log (when given)
    pub fn capture(store: Option<&LedgerStore>, copy_log: Option<&Path>) -> Result<Self> {
        let (copied, skipped) = match store {
            Some(store) => (store.copied_content_ids()?, store.skipped_content_ids()?),
            None => (HashSet::new(), HashSet::new()),
        };

        let logged_sources = match copy_log {
            Some(path) => CopyLog::load_entries(path)?,
            None => HashSet::new(),
        };

        tracing::info!(
            "📒 Ledger snapshot: {} copied, {} skipped, {} logged sources",
            copied.len(),
            skipped.len(),
            logged_sources.len()
        );

        Ok(Self {
            copied,
            skipped,
            logged_sources,
        })
    }

    pub fn is_copied(&self, content_id: &str) -> bool {
        self.copied.contains(content_id)
    }

    pub fn is_skipped(&self, content_id: &str) -> bool {
        self.skipped.contains(content_id)
    }

    pub fn is_logged(&self, source: &Path) -> bool {
        !self.logged_sources.is_empty()
            && self
                .logged_sources
                .contains(source.to_string_lossy().as_ref())
    }
}
