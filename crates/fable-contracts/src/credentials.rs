use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::bail;
use serde_json::{Map, Value};

pub const NO_KEY_SENTINEL: &str = "NO_API_KEY";
pub const API_KEY_STORAGE_KEY: &str = "gemini_api_key";

static GLOBAL_HOLDER: OnceLock<CredentialHolder> = OnceLock::new();

/// Holds the one active access token.
///
/// Clones share the same slot, so every clone observes `set`/`clear`
/// immediately. `get` is a pure read.
#[derive(Debug, Clone)]
pub struct CredentialHolder {
    active: Arc<RwLock<String>>,
    default_token: Arc<str>,
}

impl CredentialHolder {
    pub fn new(default_token: impl Into<String>) -> Self {
        let default_token = normalize_token(&default_token.into()).unwrap_or_default();
        Self {
            active: Arc::new(RwLock::new(default_token.clone())),
            default_token: Arc::from(default_token),
        }
    }

    /// Startup path: the stored token wins over the default when usable.
    pub fn from_storage(default_token: impl Into<String>, stored: Option<&str>) -> Self {
        let holder = Self::new(default_token);
        if let Some(stored) = stored {
            holder.set(stored);
        }
        holder
    }

    pub fn set(&self, token: &str) {
        let next = normalize_token(token).unwrap_or_else(|| self.default_token.to_string());
        let mut active = self.active.write().unwrap_or_else(|err| err.into_inner());
        *active = next;
    }

    pub fn clear(&self) {
        self.set("");
    }

    pub fn get(&self) -> String {
        self.active
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn has_token(&self) -> bool {
        !self.get().is_empty()
    }

    pub fn default_token(&self) -> &str {
        &self.default_token
    }
}

fn normalize_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == NO_KEY_SENTINEL {
        return None;
    }
    Some(trimmed.to_string())
}

/// Installs the process-wide holder. Installing twice is an error.
pub fn install_global(holder: CredentialHolder) -> anyhow::Result<&'static CredentialHolder> {
    if GLOBAL_HOLDER.set(holder).is_err() {
        bail!("credential holder already installed");
    }
    global().ok_or_else(|| anyhow::anyhow!("credential holder missing after install"))
}

pub fn global() -> Option<&'static CredentialHolder> {
    GLOBAL_HOLDER.get()
}

/// Durable storage for the single API key, kept in a small JSON object file.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<String> {
        read_json_object(&self.path)?
            .get(API_KEY_STORAGE_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn save(&self, token: &str) -> anyhow::Result<()> {
        let mut payload = read_json_object(&self.path).unwrap_or_default();
        payload.insert(
            API_KEY_STORAGE_KEY.to_string(),
            Value::String(token.trim().to_string()),
        );
        write_json_object(&self.path, &payload)
    }

    pub fn remove(&self) -> anyhow::Result<()> {
        let Some(mut payload) = read_json_object(&self.path) else {
            return Ok(());
        };
        if payload.remove(API_KEY_STORAGE_KEY).is_none() {
            return Ok(());
        }
        write_json_object(&self.path, &payload)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_trims_and_stores_token() {
        let holder = CredentialHolder::new("");
        holder.set("  abc123  ");
        assert_eq!(holder.get(), "abc123");
        assert!(holder.has_token());
    }

    #[test]
    fn empty_or_sentinel_falls_back_to_default() {
        let holder = CredentialHolder::new("default-key");
        holder.set("user-key");
        holder.set(NO_KEY_SENTINEL);
        assert_eq!(holder.get(), "default-key");

        holder.set("user-key");
        holder.set("   ");
        assert_eq!(holder.get(), "default-key");
    }

    #[test]
    fn clear_without_default_leaves_no_token() {
        let holder = CredentialHolder::new(NO_KEY_SENTINEL);
        holder.set("user-key");
        holder.clear();
        assert_eq!(holder.get(), "");
        assert!(!holder.has_token());
    }

    #[test]
    fn clones_share_the_active_token() {
        let holder = CredentialHolder::new("");
        let view = holder.clone();
        holder.set("shared");
        assert_eq!(view.get(), "shared");
    }

    #[test]
    fn from_storage_prefers_stored_token() {
        let holder = CredentialHolder::from_storage("default", Some("stored"));
        assert_eq!(holder.get(), "stored");
        let holder = CredentialHolder::from_storage("default", Some(""));
        assert_eq!(holder.get(), "default");
    }

    #[test]
    fn key_store_save_load_remove() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KeyStore::new(temp.path().join("nested").join("keys.json"));
        assert_eq!(store.load(), None);

        store.save(" secret ")?;
        assert_eq!(store.load().as_deref(), Some("secret"));

        store.remove()?;
        assert_eq!(store.load(), None);
        Ok(())
    }

    #[test]
    fn key_store_remove_preserves_unrelated_entries() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("keys.json");
        std::fs::write(&path, r#"{"gemini_api_key": "k", "other": 1}"#)?;
        let store = KeyStore::new(&path);
        store.remove()?;

        let raw = std::fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["other"], Value::from(1));
        assert!(parsed.get(API_KEY_STORAGE_KEY).is_none());
        Ok(())
    }

    #[test]
    fn key_store_remove_on_missing_file_is_noop() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KeyStore::new(temp.path().join("missing.json"));
        store.remove()?;
        assert!(!store.path().exists());
        Ok(())
    }
}
