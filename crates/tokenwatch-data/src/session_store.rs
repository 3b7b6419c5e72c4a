//! Named aliases for session UUIDs.
//!
//! Sessions can be given human-readable names. Names form a secondary
//! unique index: binding a name already held by another session fails,
//! and renaming releases the previous binding.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokenwatch_core::{Result, WatchError};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Metadata stored per known session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Canonical session UUID.
    pub session_id: String,
    /// Optional human-readable alias, unique across sessions.
    #[serde(default)]
    pub name: Option<String>,
    /// When the session was first recorded.
    pub created_at: DateTime<Utc>,
    /// When usage was last observed for the session.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Store of session metadata with a unique name index.
pub trait SessionStore: Send + Sync {
    /// Metadata for `session_id`, if known.
    fn get(&self, session_id: &str) -> Result<Option<SessionMeta>>;

    /// Insert or replace metadata for a session.
    ///
    /// Fails with [`WatchError::NameTaken`] when the metadata carries a
    /// name already bound to a different session.
    fn put(&self, meta: SessionMeta) -> Result<()>;

    /// Resolve a name to its session UUID.
    fn lookup_name(&self, name: &str) -> Result<Option<String>>;

    /// Bind `name` to an existing session, releasing any previous name it
    /// held. Fails when the session is unknown or the name is taken by a
    /// different session.
    fn rename(&self, session_id: &str, name: &str) -> Result<()>;

    /// All known sessions, ordered by session id.
    fn list(&self) -> Result<Vec<SessionMeta>>;
}

// ── Shared index logic ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SessionTable {
    sessions: HashMap<String, SessionMeta>,
    /// name -> session_id, rebuilt from `sessions` on load.
    #[serde(skip)]
    names: HashMap<String, String>,
}

impl SessionTable {
    fn rebuild_names(&mut self) {
        self.names = self
            .sessions
            .values()
            .filter_map(|m| m.name.clone().map(|n| (n, m.session_id.clone())))
            .collect();
    }

    fn check_name_free(&self, name: &str, session_id: &str) -> Result<()> {
        match self.names.get(name) {
            Some(owner) if owner != session_id => Err(WatchError::NameTaken {
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn put(&mut self, meta: SessionMeta) -> Result<()> {
        if let Some(name) = &meta.name {
            self.check_name_free(name, &meta.session_id)?;
        }
        // Release any name the previous record held.
        if let Some(prev) = self.sessions.get(&meta.session_id) {
            if let Some(prev_name) = &prev.name {
                self.names.remove(prev_name);
            }
        }
        if let Some(name) = &meta.name {
            self.names
                .insert(name.clone(), meta.session_id.clone());
        }
        self.sessions.insert(meta.session_id.clone(), meta);
        Ok(())
    }

    fn rename(&mut self, session_id: &str, name: &str) -> Result<()> {
        self.check_name_free(name, session_id)?;
        let meta = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| WatchError::UnknownSession(session_id.to_string()))?;
        if let Some(prev) = meta.name.take() {
            self.names.remove(&prev);
        }
        meta.name = Some(name.to_string());
        self.names.insert(name.to_string(), session_id.to_string());
        Ok(())
    }

    fn list(&self) -> Vec<SessionMeta> {
        let mut all: Vec<SessionMeta> = self.sessions.values().cloned().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// Volatile session store for tests.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    table: Mutex<SessionTable>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, session_id: &str) -> Result<Option<SessionMeta>> {
        let table = self.lock()?;
        Ok(table.sessions.get(session_id).cloned())
    }

    fn put(&self, meta: SessionMeta) -> Result<()> {
        self.lock()?.put(meta)
    }

    fn lookup_name(&self, name: &str) -> Result<Option<String>> {
        let table = self.lock()?;
        Ok(table.names.get(name).cloned())
    }

    fn rename(&self, session_id: &str, name: &str) -> Result<()> {
        self.lock()?.rename(session_id, name)
    }

    fn list(&self) -> Result<Vec<SessionMeta>> {
        Ok(self.lock()?.list())
    }
}

impl MemorySessionStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SessionTable>> {
        self.table
            .lock()
            .map_err(|e| WatchError::Store(e.to_string()))
    }
}

// ── JSON-file implementation ──────────────────────────────────────────────────

/// File-backed session store, written atomically like the position store.
#[derive(Debug)]
pub struct JsonSessionStore {
    store_path: PathBuf,
    table: Mutex<SessionTable>,
}

impl JsonSessionStore {
    /// Open (or create) the store backed by `store_path`.
    pub fn open(store_path: impl Into<PathBuf>) -> Result<Self> {
        let store_path = store_path.into();
        let mut table: SessionTable = match std::fs::read_to_string(&store_path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionTable::default(),
            Err(e) => {
                return Err(WatchError::FileRead {
                    path: store_path,
                    source: e,
                })
            }
        };
        table.rebuild_names();
        Ok(Self {
            store_path,
            table: Mutex::new(table),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SessionTable>> {
        self.table
            .lock()
            .map_err(|e| WatchError::Store(e.to_string()))
    }

    fn persist(&self, table: &SessionTable) -> Result<()> {
        let tmp_path = self.store_path.with_extension("json.tmp");
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = std::fs::File::create(&tmp_path)?;
        serde_json::to_writer_pretty(&mut tmp, table)?;
        tmp.flush()?;
        std::fs::rename(&tmp_path, &self.store_path)?;
        Ok(())
    }
}

impl SessionStore for JsonSessionStore {
    fn get(&self, session_id: &str) -> Result<Option<SessionMeta>> {
        Ok(self.lock()?.sessions.get(session_id).cloned())
    }

    fn put(&self, meta: SessionMeta) -> Result<()> {
        let mut table = self.lock()?;
        table.put(meta)?;
        self.persist(&table)
    }

    fn lookup_name(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lock()?.names.get(name).cloned())
    }

    fn rename(&self, session_id: &str, name: &str) -> Result<()> {
        let mut table = self.lock()?;
        table.rename(session_id, name)?;
        self.persist(&table)
    }

    fn list(&self) -> Result<Vec<SessionMeta>> {
        Ok(self.lock()?.list())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const UUID_A: &str = "2c84a9ff-12de-4f08-9be1-30c6f3f19a8a";
    const UUID_B: &str = "7b1d03aa-45cd-4e11-9f02-aa10b94c2d17";

    fn meta(id: &str, name: Option<&str>) -> SessionMeta {
        SessionMeta {
            session_id: id.to_string(),
            name: name.map(|s| s.to_string()),
            created_at: Utc::now(),
            last_seen: None,
        }
    }

    // ── put / get ─────────────────────────────────────────────────────────

    #[test]
    fn test_put_then_get() {
        let store = MemorySessionStore::new();
        store.put(meta(UUID_A, None)).unwrap();
        let got = store.get(UUID_A).unwrap().unwrap();
        assert_eq!(got.session_id, UUID_A);
        assert!(store.get(UUID_B).unwrap().is_none());
    }

    // ── name uniqueness ───────────────────────────────────────────────────

    #[test]
    fn test_name_uniqueness_enforced() {
        let store = MemorySessionStore::new();
        store.put(meta(UUID_A, Some("refactor"))).unwrap();
        let err = store.put(meta(UUID_B, Some("refactor"))).unwrap_err();
        assert!(matches!(err, WatchError::NameTaken { .. }));
    }

    #[test]
    fn test_put_same_session_same_name_ok() {
        let store = MemorySessionStore::new();
        store.put(meta(UUID_A, Some("refactor"))).unwrap();
        store.put(meta(UUID_A, Some("refactor"))).unwrap();
        assert_eq!(store.lookup_name("refactor").unwrap().unwrap(), UUID_A);
    }

    // ── rename ────────────────────────────────────────────────────────────

    #[test]
    fn test_rename_binds_and_releases() {
        let store = MemorySessionStore::new();
        store.put(meta(UUID_A, Some("old-name"))).unwrap();
        store.rename(UUID_A, "new-name").unwrap();

        assert_eq!(store.lookup_name("new-name").unwrap().unwrap(), UUID_A);
        assert!(store.lookup_name("old-name").unwrap().is_none());

        // The released name is free for another session.
        store.put(meta(UUID_B, None)).unwrap();
        store.rename(UUID_B, "old-name").unwrap();
        assert_eq!(store.lookup_name("old-name").unwrap().unwrap(), UUID_B);
    }

    #[test]
    fn test_rename_unknown_session() {
        let store = MemorySessionStore::new();
        let err = store.rename(UUID_A, "name").unwrap_err();
        assert!(matches!(err, WatchError::UnknownSession(_)));
    }

    #[test]
    fn test_rename_taken_name_fails() {
        let store = MemorySessionStore::new();
        store.put(meta(UUID_A, Some("busy"))).unwrap();
        store.put(meta(UUID_B, None)).unwrap();
        let err = store.rename(UUID_B, "busy").unwrap_err();
        assert!(matches!(err, WatchError::NameTaken { .. }));
        // A's binding is untouched.
        assert_eq!(store.lookup_name("busy").unwrap().unwrap(), UUID_A);
    }

    // ── list ──────────────────────────────────────────────────────────────

    #[test]
    fn test_list_ordered() {
        let store = MemorySessionStore::new();
        store.put(meta(UUID_B, None)).unwrap();
        store.put(meta(UUID_A, None)).unwrap();
        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].session_id < all[1].session_id);
    }

    // ── JsonSessionStore ──────────────────────────────────────────────────

    #[test]
    fn test_json_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");

        {
            let store = JsonSessionStore::open(&path).unwrap();
            store.put(meta(UUID_A, Some("alpha"))).unwrap();
            store.put(meta(UUID_B, None)).unwrap();
        }

        let reopened = JsonSessionStore::open(&path).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 2);
        // Name index is rebuilt on load.
        assert_eq!(reopened.lookup_name("alpha").unwrap().unwrap(), UUID_A);
        let err = reopened.put(meta(UUID_B, Some("alpha"))).unwrap_err();
        assert!(matches!(err, WatchError::NameTaken { .. }));
    }

    #[test]
    fn test_json_store_rename_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");

        {
            let store = JsonSessionStore::open(&path).unwrap();
            store.put(meta(UUID_A, None)).unwrap();
            store.rename(UUID_A, "named").unwrap();
        }

        let reopened = JsonSessionStore::open(&path).unwrap();
        assert_eq!(reopened.lookup_name("named").unwrap().unwrap(), UUID_A);
    }
}
