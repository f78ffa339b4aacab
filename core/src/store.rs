use crate::auth::{Session, User};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::warn;

pub const TOKEN_KEY: &str = "token";
pub const USER_ID_KEY: &str = "user_id";
pub const USER_KEY: &str = "user";

/// String key-value storage that outlives the process.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Key-value store persisted as a single JSON object on disk.
///
/// The whole file is rewritten on every mutation; a missing file is an empty store.
#[derive(Clone)]
pub struct FileSessionStore {
    path: PathBuf,
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl FileSessionStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "session store is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read session store");
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "exemi").map(|dirs| dirs.data_dir().join("session.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stages the entries in an owner-only sibling temp file and renames it over the store.
    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let serialized = serde_json::to_vec_pretty(entries)?;
        let mut staged = NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to stage {}", self.path.display()))?;
        staged.write_all(&serialized)?;
        staged.as_file().sync_all()?;
        staged
            .persist(&self.path)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_owned(), value.to_owned());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Seeds a session from the store.
///
/// Without a token the other keys are stale leftovers and get removed. Values that no
/// longer parse are dropped; the user is fetched again once the session is ready.
pub fn read_session(store: &dyn SessionStore) -> Session {
    let Some(token) = store.get(TOKEN_KEY) else {
        for key in [USER_ID_KEY, USER_KEY] {
            if store.get(key).is_some() {
                if let Err(err) = store.remove(key) {
                    warn!(key, %err, "failed to drop stale session key");
                }
            }
        }
        return Session::default();
    };
    let user_id = store
        .get(USER_ID_KEY)
        .and_then(|raw| raw.trim().parse::<i64>().ok());
    let user = store.get(USER_KEY).and_then(|raw| {
        serde_json::from_str::<User>(&raw)
            .map_err(|err| warn!(%err, "stored user is unreadable"))
            .ok()
    });
    Session {
        token: Some(token),
        user_id,
        user,
    }
}

/// Mirrors every session field into the store; `None` removes the key.
pub fn write_session(store: &dyn SessionStore, session: &Session) -> Result<()> {
    match &session.token {
        Some(token) => store.set(TOKEN_KEY, token)?,
        None => store.remove(TOKEN_KEY)?,
    }
    match session.user_id {
        Some(user_id) => store.set(USER_ID_KEY, &user_id.to_string())?,
        None => store.remove(USER_ID_KEY)?,
    }
    match &session.user {
        Some(user) => store.set(USER_KEY, &serde_json::to_string(user)?)?,
        None => store.remove(USER_KEY)?,
    }
    Ok(())
}
