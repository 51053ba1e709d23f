//! Durable snapshots of conversation state.
//!
//! ## Responsibility
//! Persist the live conversation map at shutdown and hand it back at startup.
//!
//! ## Guarantees
//! - Atomic file replacement: [`JsonFileSnapshot`] writes a sibling temp file
//!   and renames it over the target, so a crash never leaves a torn file.
//! - A missing file is not an error; it loads as `None`.
//!
//! ## NOT Responsible For
//! - Dropping expired entries on load (that belongs to the store)

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::ConversationState;

/// Errors from reading or writing a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// File I/O failed.
    #[error("snapshot I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be encoded or decoded.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// On-disk form of the conversation map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Live entries at that time.
    pub entries: Vec<ConversationState>,
}

impl ConversationSnapshot {
    /// Snapshot `entries` stamped with the current wall-clock time.
    pub fn now(entries: Vec<ConversationState>) -> Self {
        Self {
            saved_at: Utc::now(),
            entries,
        }
    }
}

/// Where conversation snapshots are kept.
#[async_trait]
pub trait StateSnapshotStore: Send + Sync + Debug {
    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &ConversationSnapshot) -> Result<(), SnapshotError>;

    /// Read the stored snapshot, if any.
    async fn load(&self) -> Result<Option<ConversationSnapshot>, SnapshotError>;
}

/// JSON file on local disk.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshot {
    path: PathBuf,
}

impl JsonFileSnapshot {
    /// Snapshot stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(path: &Path, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl StateSnapshotStore for JsonFileSnapshot {
    async fn save(&self, snapshot: &ConversationSnapshot) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Self::io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Self::io_err(&self.path, e))
    }

    async fn load(&self) -> Result<Option<ConversationSnapshot>, SnapshotError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(&self.path, e)),
        }
    }
}

/// Persistence disabled: saves are discarded, loads are empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshot;

#[async_trait]
impl StateSnapshotStore for NoSnapshot {
    async fn save(&self, _snapshot: &ConversationSnapshot) -> Result<(), SnapshotError> {
        Ok(())
    }

    async fn load(&self) -> Result<Option<ConversationSnapshot>, SnapshotError> {
        Ok(None)
    }
}

/// In-process snapshot slot, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    slot: Mutex<Option<ConversationSnapshot>>,
}

impl MemorySnapshot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot pre-filled with `snapshot`.
    pub fn with(snapshot: ConversationSnapshot) -> Self {
        Self {
            slot: Mutex::new(Some(snapshot)),
        }
    }

    /// Copy of the stored snapshot.
    pub fn current(&self) -> Option<ConversationSnapshot> {
        self.slot.lock().clone()
    }
}

#[async_trait]
impl StateSnapshotStore for MemorySnapshot {
    async fn save(&self, snapshot: &ConversationSnapshot) -> Result<(), SnapshotError> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<ConversationSnapshot>, SnapshotError> {
        Ok(self.slot.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConversationSnapshot {
        ConversationSnapshot::now(vec![ConversationState::fresh("u", "T1", 100)])
    }

    #[tokio::test]
    async fn test_json_file_roundtrip_and_no_temp_left() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("conversations.json");
        let store = JsonFileSnapshot::new(&path);

        store.save(&sample()).await.expect("save");
        let loaded = store.load().await.expect("load").expect("present");
        assert_eq!(loaded.entries, sample().entries);
        assert!(!dir.path().join("conversations.json.tmp").exists());

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("saved_at"));
        assert!(raw.contains("lastActivity"));
    }

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileSnapshot::new(dir.path().join("absent.json"));
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").expect("write");
        let err = JsonFileSnapshot::new(&path).load().await.unwrap_err();
        assert!(matches!(err, SnapshotError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_memory_and_null_snapshots() {
        let mem = MemorySnapshot::new();
        assert!(mem.load().await.expect("load").is_none());
        mem.save(&sample()).await.expect("save");
        assert_eq!(mem.current().map(|s| s.entries.len()), Some(1));

        NoSnapshot.save(&sample()).await.expect("save");
        assert!(NoSnapshot.load().await.expect("load").is_none());
    }
}
