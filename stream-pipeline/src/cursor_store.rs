//! Durable storage for per-partition cursors.
//!
//! Cursors are keyed by `(source_id, partition)`: reusing a source identity
//! across restarts resumes from its cursors, a new identity starts fresh.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::types::Cursor;

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// The last committed offset for a partition, if any was ever saved
    async fn load(&self, source_id: &str, partition: i32) -> Result<Option<i64>, StoreError>;

    /// Durably record a cursor. Must not return before the write is durable.
    async fn save(&self, cursor: &Cursor) -> Result<(), StoreError>;
}

type CursorKey = (String, i32);

/// In-memory cursor store, survives pipeline restarts but not process restarts
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<CursorKey, i64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cursor, as if it had been committed by a previous run
    pub async fn seed(&self, source_id: &str, partition: i32, committed_offset: i64) {
        self.cursors
            .lock()
            .await
            .insert((source_id.to_string(), partition), committed_offset);
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, source_id: &str, partition: i32) -> Result<Option<i64>, StoreError> {
        Ok(self
            .cursors
            .lock()
            .await
            .get(&(source_id.to_string(), partition))
            .copied())
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), StoreError> {
        self.cursors.lock().await.insert(
            (cursor.source_id.clone(), cursor.partition),
            cursor.committed_offset,
        );
        Ok(())
    }
}

/// Cursor store backed by a single JSON file.
///
/// Every save rewrites the whole file into a sibling temporary file, syncs it
/// and renames it over the original, so a crash leaves either the old or the
/// new content on disk.
pub struct FileCursorStore {
    path: PathBuf,
    cursors: Mutex<Option<HashMap<CursorKey, i64>>>,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursors: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(path: &Path) -> Result<HashMap<CursorKey, i64>, StoreError> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let cursors: Vec<Cursor> = serde_json::from_slice(&contents)?;
        Ok(cursors
            .into_iter()
            .map(|c| ((c.source_id, c.partition), c.committed_offset))
            .collect())
    }

    async fn write_file(path: &Path, cursors: &HashMap<CursorKey, i64>) -> Result<(), StoreError> {
        let mut entries: Vec<Cursor> = cursors
            .iter()
            .map(|((source_id, partition), offset)| Cursor::new(source_id.clone(), *partition, *offset))
            .collect();
        entries.sort_by(|a, b| (&a.source_id, a.partition).cmp(&(&b.source_id, b.partition)));
        let contents = serde_json::to_vec_pretty(&entries)?;

        let tmp_path = path.with_extension("tmp");
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&contents).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, source_id: &str, partition: i32) -> Result<Option<i64>, StoreError> {
        let mut cached = self.cursors.lock().await;
        if cached.is_none() {
            *cached = Some(Self::read_file(&self.path).await?);
        }
        Ok(cached
            .as_ref()
            .and_then(|c| c.get(&(source_id.to_string(), partition)).copied()))
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), StoreError> {
        let mut cached = self.cursors.lock().await;
        let mut cursors = match cached.as_ref() {
            Some(cursors) => cursors.clone(),
            None => Self::read_file(&self.path).await?,
        };
        cursors.insert(
            (cursor.source_id.clone(), cursor.partition),
            cursor.committed_offset,
        );

        // the cache only reflects what reached the disk
        Self::write_file(&self.path, &cursors).await?;
        *cached = Some(cursors);

        debug!(
            path = %self.path.display(),
            source_id = cursor.source_id,
            partition = cursor.partition,
            offset = cursor.committed_offset,
            "Saved cursor"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.load("spout", 0).await.unwrap(), None);

        store.save(&Cursor::new("spout", 0, 10)).await.unwrap();
        assert_eq!(store.load("spout", 0).await.unwrap(), Some(10));
        assert_eq!(store.load("spout", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_new_identity_starts_fresh() {
        let store = MemoryCursorStore::new();
        store.save(&Cursor::new("spout-a", 0, 10)).await.unwrap();

        assert_eq!(store.load("spout-b", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");

        let store = FileCursorStore::new(&path);
        store.save(&Cursor::new("spout", 0, 5)).await.unwrap();
        store.save(&Cursor::new("spout", 1, 7)).await.unwrap();
        store.save(&Cursor::new("spout", 0, 9)).await.unwrap();
        drop(store);

        let reopened = FileCursorStore::new(&path);
        assert_eq!(reopened.load("spout", 0).await.unwrap(), Some(9));
        assert_eq!(reopened.load("spout", 1).await.unwrap(), Some(7));
        assert_eq!(reopened.load("other", 0).await.unwrap(), None);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCursorStore::new(dir.path().join("missing.json"));

        assert_eq!(store.load("spout", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = FileCursorStore::new(&path);
        assert!(matches!(
            store.load("spout", 0).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
