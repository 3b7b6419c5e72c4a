//! Durable read-offset tracking.
//!
//! The reader persists the last-read byte offset per session file so a
//! restarted process resumes where the previous one stopped. The store
//! contract is a flat `path -> offset` map with single-key get/set; both
//! operations must be safe under concurrent callers.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokenwatch_core::{Result, WatchError};
use tracing::debug;

// ── Contract ──────────────────────────────────────────────────────────────────

/// Durable map from absolute file path to last-read byte offset.
///
/// `get` returns 0 for unknown paths. Implementations must tolerate
/// concurrent calls; callers only ever issue single-key operations, so no
/// multi-key atomicity is promised.
pub trait PositionStore: Send + Sync {
    /// Last persisted offset for `path`, or 0 when absent.
    fn get(&self, path: &Path) -> Result<u64>;

    /// Persist `offset` for `path`.
    fn set(&self, path: &Path, offset: u64) -> Result<()>;
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// Volatile store used by tests and one-shot commands.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: Mutex<HashMap<PathBuf, u64>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn get(&self, path: &Path) -> Result<u64> {
        let positions = self
            .positions
            .lock()
            .map_err(|e| WatchError::Store(e.to_string()))?;
        Ok(positions.get(path).copied().unwrap_or(0))
    }

    fn set(&self, path: &Path, offset: u64) -> Result<()> {
        let mut positions = self
            .positions
            .lock()
            .map_err(|e| WatchError::Store(e.to_string()))?;
        positions.insert(path.to_path_buf(), offset);
        Ok(())
    }
}

// ── JSON-file implementation ──────────────────────────────────────────────────

/// File-backed store that survives process restarts.
///
/// The whole map is serialised to one JSON document. Writes go to a
/// sibling temp file first and are moved into place with an atomic
/// rename, so a crash mid-write never corrupts the previous state.
#[derive(Debug)]
pub struct JsonPositionStore {
    store_path: PathBuf,
    positions: Mutex<HashMap<String, u64>>,
}

impl JsonPositionStore {
    /// Open (or create) the store backed by `store_path`.
    ///
    /// A missing file yields an empty store; a corrupt file is an error
    /// rather than silent data loss.
    pub fn open(store_path: impl Into<PathBuf>) -> Result<Self> {
        let store_path = store_path.into();
        let positions = match std::fs::read_to_string(&store_path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(WatchError::FileRead {
                    path: store_path,
                    source: e,
                })
            }
        };
        debug!(
            "Opened position store {} with {} entries",
            store_path.display(),
            positions.len()
        );
        Ok(Self {
            store_path,
            positions: Mutex::new(positions),
        })
    }

    /// Write the current map to disk via temp file + rename.
    fn persist(&self, positions: &HashMap<String, u64>) -> Result<()> {
        let tmp_path = self.store_path.with_extension("json.tmp");
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = std::fs::File::create(&tmp_path)?;
        serde_json::to_writer_pretty(&mut tmp, positions)?;
        tmp.flush()?;
        std::fs::rename(&tmp_path, &self.store_path)?;
        Ok(())
    }
}

impl PositionStore for JsonPositionStore {
    fn get(&self, path: &Path) -> Result<u64> {
        let positions = self
            .positions
            .lock()
            .map_err(|e| WatchError::Store(e.to_string()))?;
        Ok(positions
            .get(&path.to_string_lossy().to_string())
            .copied()
            .unwrap_or(0))
    }

    fn set(&self, path: &Path, offset: u64) -> Result<()> {
        let mut positions = self
            .positions
            .lock()
            .map_err(|e| WatchError::Store(e.to_string()))?;
        positions.insert(path.to_string_lossy().to_string(), offset);
        self.persist(&positions)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    // ── MemoryPositionStore ───────────────────────────────────────────────

    #[test]
    fn test_memory_store_absent_is_zero() {
        let store = MemoryPositionStore::new();
        assert_eq!(store.get(Path::new("/a/b.jsonl")).unwrap(), 0);
    }

    #[test]
    fn test_memory_store_set_then_get() {
        let store = MemoryPositionStore::new();
        store.set(Path::new("/a/b.jsonl"), 1234).unwrap();
        assert_eq!(store.get(Path::new("/a/b.jsonl")).unwrap(), 1234);
        assert_eq!(store.get(Path::new("/a/other.jsonl")).unwrap(), 0);
    }

    #[test]
    fn test_memory_store_overwrite() {
        let store = MemoryPositionStore::new();
        store.set(Path::new("/a"), 10).unwrap();
        store.set(Path::new("/a"), 20).unwrap();
        assert_eq!(store.get(Path::new("/a")).unwrap(), 20);
    }

    #[test]
    fn test_memory_store_concurrent_sets() {
        let store = Arc::new(MemoryPositionStore::new());
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let path = PathBuf::from(format!("/file-{i}.jsonl"));
                for offset in 0..100u64 {
                    store.set(&path, offset).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8u64 {
            let path = PathBuf::from(format!("/file-{i}.jsonl"));
            assert_eq!(store.get(&path).unwrap(), 99);
        }
    }

    // ── JsonPositionStore ─────────────────────────────────────────────────

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("positions.json");

        {
            let store = JsonPositionStore::open(&store_path).unwrap();
            store.set(Path::new("/data/a.jsonl"), 512).unwrap();
            store.set(Path::new("/data/b.jsonl"), 1024).unwrap();
        }

        let reopened = JsonPositionStore::open(&store_path).unwrap();
        assert_eq!(reopened.get(Path::new("/data/a.jsonl")).unwrap(), 512);
        assert_eq!(reopened.get(Path::new("/data/b.jsonl")).unwrap(), 1024);
        assert_eq!(reopened.get(Path::new("/data/c.jsonl")).unwrap(), 0);
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonPositionStore::open(dir.path().join("new.json")).unwrap();
        assert_eq!(store.get(Path::new("/x")).unwrap(), 0);
    }

    #[test]
    fn test_json_store_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("state").join("positions.json");
        let store = JsonPositionStore::open(&nested).unwrap();
        store.set(Path::new("/x"), 7).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn test_json_store_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("positions.json");
        std::fs::write(&store_path, "{definitely not json").unwrap();
        assert!(JsonPositionStore::open(&store_path).is_err());
    }

    #[test]
    fn test_json_store_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("positions.json");
        let store = JsonPositionStore::open(&store_path).unwrap();
        store.set(Path::new("/x"), 1).unwrap();
        assert!(!store_path.with_extension("json.tmp").exists());
    }
}
