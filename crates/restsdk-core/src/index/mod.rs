//! Metadata index loading
//!
//! The device keeps one row per file or directory in the `files` table of its
//! SQLite index. Only the columns needed to rebuild paths and restore
//! timestamps are loaded; the index is read-only once built and is shared by
//! reference across the copy workers.

pub mod reconstruct;

pub use reconstruct::{
    detect_synthetic_root, ExactNameRule, MarkerPipeRule, NoSyntheticRoot, PathReconstructor,
    SyntheticRootRule,
};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{RestoreError, Result};

/// Table holding the device's file records
pub const FILES_TABLE: &str = "files";

const REQUIRED_COLUMNS: [&str; 4] = ["id", "parentID", "contentID", "name"];
const TIMESTAMP_COLUMNS: [&str; 4] = ["imageDate", "videoDate", "cTime", "birthTime"];

/// One row of the metadata index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    /// Blob identifier; `None` for directory nodes
    pub content_id: Option<String>,
    /// Milliseconds since the Unix epoch
    pub image_date: Option<i64>,
    pub video_date: Option<i64>,
    pub creation_time: Option<i64>,
    pub birth_time: Option<i64>,
}

impl FileRecord {
    /// Directory node with the given parent
    pub fn directory(id: impl Into<String>, parent_id: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.map(str::to_string),
            name: name.into(),
            content_id: None,
            image_date: None,
            video_date: None,
            creation_time: None,
            birth_time: None,
        }
    }

    /// Regular file backed by a blob
    pub fn file(
        id: impl Into<String>,
        parent_id: Option<&str>,
        name: impl Into<String>,
        content_id: impl Into<String>,
    ) -> Self {
        Self {
            content_id: Some(content_id.into()),
            ..Self::directory(id, parent_id, name)
        }
    }

    /// True when the record has blob content
    pub fn is_file(&self) -> bool {
        self.content_id.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// Best available original modification time in milliseconds.
    ///
    /// Priority: image date, video date, creation time, birth time.
    pub fn best_timestamp_ms(&self) -> Option<i64> {
        [
            self.image_date,
            self.video_date,
            self.creation_time,
            self.birth_time,
        ]
        .into_iter()
        .flatten()
        .next()
    }
}

/// In-memory view of the `files` table with id and content-id lookups
#[derive(Debug, Default)]
pub struct MetadataIndex {
    /// Records in load order
    records: Vec<FileRecord>,
    by_id: HashMap<String, usize>,
    by_content: HashMap<String, usize>,
}

impl MetadataIndex {
    /// Open the index database read-only and load every file record
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RestoreError::Storage(format!(
                "index database not found: {}",
                path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            RestoreError::Storage(format!("cannot open index {}: {}", path.display(), e))
        })?;

        let index = Self::from_connection(&conn)?;
        tracing::info!(
            "📚 Loaded {} records ({} files, {} directories) from {}",
            index.len(),
            index.file_count(),
            index.dir_count(),
            path.display()
        );
        Ok(index)
    }

    /// Load records from an already open connection
    pub fn from_connection(conn: &Connection) -> Result<Self> {
        let columns = table_columns(conn, FILES_TABLE)?;
        if columns.is_empty() {
            return Err(RestoreError::Storage(format!(
                "table '{}' not found in index",
                FILES_TABLE
            )));
        }

        let has = |col: &str| columns.iter().any(|c| c.eq_ignore_ascii_case(col));

        let missing: Vec<&str> = REQUIRED_COLUMNS.iter().copied().filter(|c| !has(c)).collect();
        if !missing.is_empty() {
            return Err(RestoreError::Storage(format!(
                "table '{}' lacks required columns: {}",
                FILES_TABLE,
                missing.join(", ")
            )));
        }

        // Timestamp columns vary between firmware versions; absent ones read as NULL
        let timestamp_select: Vec<String> = TIMESTAMP_COLUMNS
            .iter()
            .map(|c| {
                if has(c) {
                    c.to_string()
                } else {
                    tracing::debug!("Index has no '{}' column", c);
                    "NULL".to_string()
                }
            })
            .collect();

        let sql = format!(
            "SELECT id, parentID, contentID, name, {} FROM {}",
            timestamp_select.join(", "),
            FILES_TABLE
        );

        let storage = |e: rusqlite::Error| RestoreError::Storage(format!("query failed: {}", e));

        let mut stmt = conn.prepare(&sql).map_err(storage)?;
        let records = stmt
            .query_map([], |row| {
                Ok(FileRecord {
                    id: value_to_string(row.get_ref(0)?).unwrap_or_default(),
                    parent_id: value_to_string(row.get_ref(1)?),
                    content_id: value_to_string(row.get_ref(2)?),
                    name: value_to_string(row.get_ref(3)?).unwrap_or_default(),
                    image_date: value_to_millis(row.get_ref(4)?),
                    video_date: value_to_millis(row.get_ref(5)?),
                    creation_time: value_to_millis(row.get_ref(6)?),
                    birth_time: value_to_millis(row.get_ref(7)?),
                })
            })
            .map_err(storage)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage)?;

        Ok(Self::from_records(records))
    }

    /// Build an index from records already in memory
    pub fn from_records(records: Vec<FileRecord>) -> Self {
        let mut by_id = HashMap::with_capacity(records.len());
        let mut by_content = HashMap::new();

        for (pos, record) in records.iter().enumerate() {
            if by_id.insert(record.id.clone(), pos).is_some() {
                tracing::warn!("Duplicate record id {} in index; last row wins", record.id);
            }
            if record.is_file() {
                if let Some(cid) = &record.content_id {
                    // First record claiming a blob keeps it
                    by_content.entry(cid.clone()).or_insert(pos);
                }
            }
        }

        Self {
            records,
            by_id,
            by_content,
        }
    }

    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.by_id.get(id).map(|&pos| &self.records[pos])
    }

    /// Reverse lookup from blob name to its record
    pub fn by_content_id(&self, content_id: &str) -> Option<&FileRecord> {
        self.by_content.get(content_id).map(|&pos| &self.records[pos])
    }

    /// All records in load order
    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    /// Records with blob content, in load order
    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter().filter(|r| r.is_file())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    pub fn dir_count(&self) -> usize {
        self.records.len() - self.file_count()
    }
}

/// Column names of a table; empty when the table does not exist
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let storage = |e: rusqlite::Error| RestoreError::Storage(format!("cannot read schema: {}", e));

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .map_err(storage)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(storage)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(storage)?;
    Ok(columns)
}

/// Ids are stored as integers or text depending on firmware
pub(crate) fn value_to_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

/// Only numeric values count as timestamps
fn value_to_millis(value: ValueRef<'_>) -> Option<i64> {
    match value {
        ValueRef::Integer(i) => Some(i),
        ValueRef::Real(f) if f.is_finite() => Some(f as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_index(dir: &Path, with_timestamps: bool) -> std::path::PathBuf {
        let db_path = dir.join("index.db");
        let conn = Connection::open(&db_path).unwrap();
        if with_timestamps {
            conn.execute_batch(
                "CREATE TABLE files (id TEXT PRIMARY KEY, parentID TEXT, contentID TEXT,
                     name TEXT, imageDate INTEGER, videoDate INTEGER, cTime INTEGER, birthTime INTEGER);
                 INSERT INTO files VALUES ('1', NULL, NULL, 'lib', NULL, NULL, NULL, NULL);
                 INSERT INTO files VALUES ('2', '1', 'abc123', 'photo.jpg', 1500000000000, 1600000000000, NULL, 'x');",
            )
            .unwrap();
        } else {
            conn.execute_batch(
                "CREATE TABLE files (id INTEGER PRIMARY KEY, parentID INTEGER, contentID TEXT, name TEXT);
                 INSERT INTO files VALUES (1, NULL, NULL, 'lib');
                 INSERT INTO files VALUES (2, 1, 'abc123', 'photo.jpg');",
            )
            .unwrap();
        }
        db_path
    }

    #[test]
    fn test_load_index() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = create_index(temp_dir.path(), true);

        let index = MetadataIndex::load(&db_path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.file_count(), 1);
        assert_eq!(index.dir_count(), 1);

        let photo = index.get("2").unwrap();
        assert_eq!(photo.parent_id.as_deref(), Some("1"));
        assert_eq!(photo.image_date, Some(1_500_000_000_000));
        assert_eq!(photo.birth_time, None);
        assert_eq!(index.by_content_id("abc123").unwrap().id, "2");
    }

    #[test]
    fn test_load_integer_ids_without_timestamp_columns() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = create_index(temp_dir.path(), false);

        let index = MetadataIndex::load(&db_path).unwrap();
        let photo = index.get("2").unwrap();
        assert_eq!(photo.parent_id.as_deref(), Some("1"));
        assert_eq!(photo.best_timestamp_ms(), None);
    }

    #[test]
    fn test_missing_database_is_storage_fault() {
        let temp_dir = TempDir::new().unwrap();
        let err = MetadataIndex::load(temp_dir.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, RestoreError::Storage(_)));
    }

    #[test]
    fn test_missing_table_is_storage_fault() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("index.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE other (id TEXT)")
            .unwrap();

        let err = MetadataIndex::load(&db_path).unwrap_err();
        assert!(matches!(err, RestoreError::Storage(_)));
    }

    #[test]
    fn test_missing_column_is_storage_fault() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("index.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch("CREATE TABLE files (id TEXT, parentID TEXT, name TEXT)")
            .unwrap();

        let err = MetadataIndex::load(&db_path).unwrap_err();
        assert!(err.to_string().contains("contentID"));
    }

    #[test]
    fn test_timestamp_priority() {
        let mut record = FileRecord::file("1", None, "a.jpg", "c1");
        record.birth_time = Some(4);
        record.creation_time = Some(3);
        assert_eq!(record.best_timestamp_ms(), Some(3));
        record.video_date = Some(2);
        record.image_date = Some(1);
        assert_eq!(record.best_timestamp_ms(), Some(1));
    }

    #[test]
    fn test_empty_content_id_is_directory() {
        let record = FileRecord::file("1", None, "dir", "");
        assert!(!record.is_file());
    }
}
