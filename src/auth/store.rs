//! Credential storage backends

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;

use crate::config::Config;

/// The two credentials the session tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    Access,
    Refresh,
}

impl CredentialKey {
    /// Persistence key name.
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKey::Access => "auth_token",
            CredentialKey::Refresh => "refresh_token",
        }
    }
}

/// Process-wide key-value holder for the access and refresh credentials.
///
/// Shared by the lifecycle manager and the request gateway, so every method
/// takes `&self`.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: CredentialKey) -> Option<String>;
    fn set(&self, key: CredentialKey, value: String);
    fn remove(&self, key: CredentialKey);

    fn clear(&self) {
        self.remove(CredentialKey::Access);
        self.remove(CredentialKey::Refresh);
    }

    fn access_token(&self) -> Option<String> {
        self.get(CredentialKey::Access)
    }

    fn refresh_token(&self) -> Option<String> {
        self.get(CredentialKey::Refresh)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CredentialKey, String>>,
}

impl MemoryStore {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with explicit credentials (one-shot commands).
    pub fn with_tokens(access: Option<&str>, refresh: Option<&str>) -> Self {
        let store = Self::default();
        if let Some(access) = access {
            store.set(CredentialKey::Access, access.to_string());
        }
        if let Some(refresh) = refresh {
            store.set(CredentialKey::Refresh, refresh.to_string());
        }
        store
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: CredentialKey) -> Option<String> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(&key).cloned()
    }

    fn set(&self, key: CredentialKey, value: String) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key, value);
    }

    fn remove(&self, key: CredentialKey) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&key);
    }
}

/// Durable store backed by the config file.
///
/// Every mutation rewrites the file. Write failures are logged, not raised.
pub struct FileStore {
    path: PathBuf,
    config: Mutex<Config>,
}

impl FileStore {
    /// Open the store at the default config location.
    pub fn open() -> Result<Self> {
        let path = Config::config_path()?;
        Self::open_at(path)
    }

    pub fn open_at(path: PathBuf) -> Result<Self> {
        let config = Config::load_from(&path)?;
        Ok(Self {
            path,
            config: Mutex::new(config),
        })
    }

    fn update(&self, what: &str, apply: impl FnOnce(&mut Config)) {
        let mut guard = self.config.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut guard);
        if let Err(e) = guard.save_to(&self.path) {
            tracing::warn!("Failed to persist {}: {:#}", what, e);
        }
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: CredentialKey) -> Option<String> {
        let guard = self.config.lock().unwrap_or_else(|e| e.into_inner());
        match key {
            CredentialKey::Access => guard.auth_token.clone(),
            CredentialKey::Refresh => guard.refresh_token.clone(),
        }
    }

    fn set(&self, key: CredentialKey, value: String) {
        self.update(key.as_str(), |config| match key {
            CredentialKey::Access => config.auth_token = Some(value),
            CredentialKey::Refresh => config.refresh_token = Some(value),
        });
    }

    fn remove(&self, key: CredentialKey) {
        self.update(key.as_str(), |config| match key {
            CredentialKey::Access => config.auth_token = None,
            CredentialKey::Refresh => config.refresh_token = None,
        });
    }

    fn clear(&self) {
        self.update("credentials", |config| {
            config.auth_token = None;
            config.refresh_token = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(CredentialKey::Access.as_str(), "auth_token");
        assert_eq!(CredentialKey::Refresh.as_str(), "refresh_token");
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryStore::with_tokens(Some("a"), Some("r"));
        assert_eq!(store.access_token().as_deref(), Some("a"));
        assert_eq!(store.refresh_token().as_deref(), Some("r"));

        store.clear();
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
    }

    #[test]
    fn test_file_store_persists_and_keeps_settings() {
        let path = std::env::temp_dir()
            .join(format!("marketlink-store-{}", uuid::Uuid::new_v4()))
            .join("config.toml");
        let mut config = Config::default();
        config.base_url = "https://market.example".to_string();
        config.save_to(&path).unwrap();

        let store = FileStore::open_at(path.clone()).unwrap();
        store.set(CredentialKey::Access, "tok".to_string());
        store.set(CredentialKey::Refresh, "ref".to_string());

        let reopened = FileStore::open_at(path.clone()).unwrap();
        assert_eq!(reopened.access_token().as_deref(), Some("tok"));
        assert_eq!(reopened.refresh_token().as_deref(), Some("ref"));

        reopened.clear();
        let config = Config::load_from(&path).unwrap();
        assert!(config.auth_token.is_none());
        assert!(config.refresh_token.is_none());
        assert_eq!(config.base_url, "https://market.example");
    }
}
