//! Durable client-side key/value state (the remembered username).

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::debug;

/// Key under which the logged-in username is remembered.
pub const CURRENT_USER_KEY: &str = "chat_user";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateStoreError {
    #[error("state entry not found")]
    NotFound,
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store backend failure: {0}")]
    Backend(String),
}

pub trait StateStore: Send + Sync {
    fn set_value(&self, key: &str, value: &str) -> Result<(), StateStoreError>;

    fn get_value(&self, key: &str) -> Result<String, StateStoreError>;

    fn delete_value(&self, key: &str) -> Result<(), StateStoreError>;
}

/// Read `key`, mapping [`StateStoreError::NotFound`] to `None`.
pub fn load_optional(store: &dyn StateStore, key: &str) -> Result<Option<String>, StateStoreError> {
    match store.get_value(key) {
        Ok(value) => Ok(Some(value)),
        Err(StateStoreError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Delete `key`; a missing entry is not an error.
pub fn forget(store: &dyn StateStore, key: &str) -> Result<(), StateStoreError> {
    match store.delete_value(key) {
        Ok(()) | Err(StateStoreError::NotFound) => Ok(()),
        Err(err) => Err(err),
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl StateStore for InMemoryStateStore {
    fn set_value(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<String, StateStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(key).cloned().ok_or(StateStoreError::NotFound)
    }

    fn delete_value(&self, key: &str) -> Result<(), StateStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))?;
        if data.remove(key).is_none() {
            return Err(StateStoreError::NotFound);
        }
        Ok(())
    }
}

/// Flat JSON object on disk, rewritten atomically on every change.
pub struct FileStateStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StateStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(StateStoreError::Unavailable(format!(
                    "failed reading state file {}: {err}",
                    self.path.display()
                )));
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw).map_err(|err| {
            StateStoreError::Backend(format!(
                "failed parsing state file {}: {err}",
                self.path.display()
            ))
        })
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                StateStoreError::Unavailable(format!(
                    "failed creating state directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let encoded =
            serde_json::to_vec(entries).map_err(|err| StateStoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(&self.path);
        fs::write(&temp_path, encoded).map_err(|err| {
            StateStoreError::Unavailable(format!(
                "failed writing temp state file {}: {err}",
                temp_path.display()
            ))
        })?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows refuses to rename over an existing file.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(StateStoreError::Backend(format!(
                        "failed replacing state file {} after rename error ({rename_err}): {err}",
                        self.path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                StateStoreError::Backend(format!(
                    "failed writing state file {}: {err}",
                    self.path.display()
                ))
            })?;
        }

        debug!(path = %self.path.display(), entries = entries.len(), "state file written");
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn set_value(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))?;
        let mut entries = self.load()?;
        entries.insert(key.to_owned(), value.to_owned());
        self.save(&entries)
    }

    fn get_value(&self, key: &str) -> Result<String, StateStoreError> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))?;
        self.load()?
            .remove(key)
            .ok_or(StateStoreError::NotFound)
    }

    fn delete_value(&self, key: &str) -> Result<(), StateStoreError> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| StateStoreError::Backend("poisoned lock".to_owned()))?;
        let mut entries = self.load()?;
        if entries.remove(key).is_none() {
            return Err(StateStoreError::NotFound);
        }
        self.save(&entries)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("state.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}
