//! Content blob lookup in the source store
//!
//! Blobs live either sharded by the lowercase first character of their
//! content id (`root/a/abc123`) or flat (`root/abc123`).

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ContentResolver {
    source_root: PathBuf,
}

impl ContentResolver {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Sharded location first, then flat
    pub fn candidates(&self, content_id: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(first) = content_id.chars().next() {
            let shard: String = first.to_lowercase().collect();
            candidates.push(self.source_root.join(shard).join(content_id));
        }
        candidates.push(self.source_root.join(content_id));
        candidates
    }

    /// Location of a blob, or `None` when it was never backed up or was deleted
    pub fn resolve(&self, content_id: &str) -> Option<PathBuf> {
        if content_id.is_empty() {
            return None;
        }
        self.candidates(content_id)
            .into_iter()
            .find(|candidate| candidate.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_sharded_layout() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("a")).unwrap();
        fs::write(temp_dir.path().join("a").join("abc123"), b"blob").unwrap();

        let resolver = ContentResolver::new(temp_dir.path());
        assert_eq!(
            resolver.resolve("abc123"),
            Some(temp_dir.path().join("a").join("abc123"))
        );
    }

    #[test]
    fn test_shard_is_lowercased() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("x")).unwrap();
        fs::write(temp_dir.path().join("x").join("XYZ9"), b"blob").unwrap();

        let resolver = ContentResolver::new(temp_dir.path());
        assert_eq!(
            resolver.resolve("XYZ9"),
            Some(temp_dir.path().join("x").join("XYZ9"))
        );
    }

    #[test]
    fn test_flat_layout_fallback() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("abc123"), b"blob").unwrap();

        let resolver = ContentResolver::new(temp_dir.path());
        assert_eq!(resolver.resolve("abc123"), Some(temp_dir.path().join("abc123")));
    }

    #[test]
    fn test_missing_blob() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = ContentResolver::new(temp_dir.path());

        assert_eq!(resolver.resolve("abc123"), None);
        assert_eq!(resolver.resolve(""), None);
    }
}
