use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use tracing::{debug, warn};

use crate::{
    error::{AuthError, Result},
    types::TokenRecord,
};

/// Storage key holding the pending PKCE verifier.
pub const VERIFIER_KEY: &str = "verifier";
/// Storage key holding the JSON-encoded token record.
pub const TOKEN_KEY: &str = "authResponse";

/// Durable string key-value storage that survives process restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// A JSON object on disk. Every write replaces the file through a rename.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(AuthError::Storage(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            },
        };
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), %e, "storage file is corrupt, starting empty");
                Ok(BTreeMap::new())
            },
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let io_err = |e: std::io::Error| {
            AuthError::Storage(format!("failed to write {}: {e}", self.path.display()))
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(map)
            .map_err(|e| AuthError::Storage(format!("failed to encode storage: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .map_err(io_err)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// Process-local storage, used where nothing should touch the disk.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Owner of the current token record: an in-memory cache in front of durable
/// storage, plus the single pending-verifier slot.
pub struct TokenStore {
    backend: Arc<dyn KeyValueStore>,
    cache: RwLock<Option<TokenRecord>>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            cache: RwLock::new(None),
        }
    }

    /// The current record, from cache or else from durable storage.
    ///
    /// Unreadable or unparsable storage yields `None`.
    pub fn get(&self) -> Option<TokenRecord> {
        if let Some(record) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Some(record.clone());
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = cache.as_ref() {
            return Some(record.clone());
        }
        let raw = match self.backend.get(TOKEN_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%e, "failed to read stored token record");
                return None;
            },
        };
        let record = match serde_json::from_str::<TokenRecord>(&raw) {
            Ok(record) if !record.access_token.is_empty() => record,
            Ok(_) => {
                warn!("stored token record has no access token, ignoring");
                return None;
            },
            Err(e) => {
                warn!(%e, "stored token record is not valid JSON, ignoring");
                return None;
            },
        };
        debug!("token record restored from durable storage");
        *cache = Some(record.clone());
        Some(record)
    }

    /// Replace the current record in durable storage and cache.
    ///
    /// The cache is only updated once the durable write has succeeded.
    pub fn set(&self, record: &TokenRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| AuthError::Storage(format!("failed to encode token record: {e}")))?;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        self.backend.set(TOKEN_KEY, &json)?;
        *cache = Some(record.clone());
        Ok(())
    }

    /// Forget the current record everywhere.
    pub fn clear(&self) -> Result<()> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        *cache = None;
        self.backend.remove(TOKEN_KEY)
    }

    pub fn put_verifier(&self, verifier: &str) -> Result<()> {
        self.backend.set(VERIFIER_KEY, verifier)
    }

    /// Remove and return the pending verifier.
    pub fn take_verifier(&self) -> Result<Option<String>> {
        let verifier = self.backend.get(VERIFIER_KEY)?;
        if verifier.is_some() {
            self.backend.remove(VERIFIER_KEY)?;
        }
        Ok(verifier.filter(|v| !v.is_empty()))
    }
}
