//! Path reconstruction from parent-pointer records
//!
//! Every record names only itself; the full relative path is rebuilt by
//! walking `parent_id` links up to a root. The device also injects one
//! spurious top-level folder (an authentication artifact whose name contains
//! a marker and a pipe) which is stripped from every path.

use super::{FileRecord, MetadataIndex};
use crate::error::{RestoreError, Result};

/// Decides which record name is the device's synthetic root folder
pub trait SyntheticRootRule: Send + Sync {
    fn is_synthetic_root(&self, name: &str) -> bool;
}

/// Name contains a marker substring and a pipe character
#[derive(Debug, Clone)]
pub struct MarkerPipeRule {
    marker: String,
}

impl MarkerPipeRule {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Default for MarkerPipeRule {
    fn default() -> Self {
        Self::new("auth")
    }
}

impl SyntheticRootRule for MarkerPipeRule {
    fn is_synthetic_root(&self, name: &str) -> bool {
        name.contains(self.marker.as_str()) && name.contains('|')
    }
}

/// Name matches exactly
#[derive(Debug, Clone)]
pub struct ExactNameRule {
    name: String,
}

impl ExactNameRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl SyntheticRootRule for ExactNameRule {
    fn is_synthetic_root(&self, name: &str) -> bool {
        name == self.name
    }
}

/// Never strips anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSyntheticRoot;

impl SyntheticRootRule for NoSyntheticRoot {
    fn is_synthetic_root(&self, _name: &str) -> bool {
        false
    }
}

/// Scan the index once; the first matching record in load order wins
pub fn detect_synthetic_root(index: &MetadataIndex, rule: &dyn SyntheticRootRule) -> Option<String> {
    let found = index
        .records()
        .iter()
        .find(|r| rule.is_synthetic_root(&r.name))
        .map(|r| r.name.clone());

    if let Some(ref name) = found {
        tracing::info!("🌳 Synthetic root folder detected: {}", name);
    }
    found
}

/// Rebuilds relative paths for records of one index
#[derive(Debug, Clone)]
pub struct PathReconstructor<'a> {
    index: &'a MetadataIndex,
    /// Normalized name of the folder to strip
    synthetic_root: Option<String>,
    sanitize_pipes: bool,
}

impl<'a> PathReconstructor<'a> {
    /// Create a reconstructor, detecting the synthetic root with `rule`
    pub fn new(index: &'a MetadataIndex, rule: &dyn SyntheticRootRule) -> Self {
        let root = detect_synthetic_root(index, rule);
        Self::with_synthetic_root(index, root)
    }

    /// Create a reconstructor with a known synthetic root
    pub fn with_synthetic_root(index: &'a MetadataIndex, synthetic_root: Option<String>) -> Self {
        Self {
            index,
            synthetic_root: synthetic_root
                .map(|r| normalize_separators(&r))
                .filter(|r| !r.is_empty()),
            sanitize_pipes: false,
        }
    }

    /// Replace `|` with `-` in reconstructed paths
    pub fn with_sanitize_pipes(mut self, sanitize: bool) -> Self {
        self.sanitize_pipes = sanitize;
        self
    }

    pub fn synthetic_root(&self) -> Option<&str> {
        self.synthetic_root.as_deref()
    }

    pub fn index(&self) -> &'a MetadataIndex {
        self.index
    }

    /// Name the record gets at the destination
    pub fn file_name(&self, record: &FileRecord) -> String {
        if self.sanitize_pipes {
            record.name.replace('|', "-")
        } else {
            record.name.clone()
        }
    }

    /// Relative path of a record, or `None` when the id is unknown or the
    /// path is empty after stripping.
    ///
    /// Fails with `Cycle` when the parent chain is longer than the index and
    /// with `DanglingParent` when a parent id is not in the index.
    pub fn reconstruct(&self, id: &str) -> Result<Option<String>> {
        let Some(record) = self.index.get(id) else {
            return Ok(None);
        };

        let names = self.ancestor_names(record)?;
        let joined = normalize_separators(&names.join("/"));
        let stripped = self.strip_synthetic_root(joined);

        let mut path = stripped.trim_start_matches('/').to_string();
        if self.sanitize_pipes {
            path = path.replace('|', "-");
        }

        Ok(if path.is_empty() { None } else { Some(path) })
    }

    /// Names from the root down to `record`
    fn ancestor_names(&self, record: &'a FileRecord) -> Result<Vec<&'a str>> {
        let limit = self.index.len();
        let mut names = vec![record.name.as_str()];
        let mut current = record;
        let mut hops = 0usize;

        while let Some(parent_id) = current.parent_id.as_deref() {
            hops += 1;
            if hops > limit {
                return Err(RestoreError::Cycle {
                    id: record.id.clone(),
                    limit,
                });
            }

            current = self
                .index
                .get(parent_id)
                .ok_or_else(|| RestoreError::DanglingParent {
                    id: current.id.clone(),
                    parent: parent_id.to_string(),
                })?;
            names.push(current.name.as_str());
        }

        names.reverse();
        Ok(names)
    }

    /// Remove exactly one `root/` occurrence, or a bare trailing `root`
    fn strip_synthetic_root(&self, mut path: String) -> String {
        let Some(root) = self.synthetic_root.as_deref() else {
            return path;
        };

        let prefixed = format!("{}/", root);
        if let Some(pos) = path.find(&prefixed) {
            path.replace_range(pos..pos + prefixed.len(), "");
        } else if path.ends_with(root) {
            path.truncate(path.len() - root.len());
        }
        path
    }
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}
