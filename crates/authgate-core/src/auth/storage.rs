//! Durable backends for the credential store.
//!
//! Each backend is a flat key/value namespace. The store writes one key for
//! the access token and one for the refresh token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Credentials file name in the cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Backends are synchronous; callers on an async runtime run them on the
/// blocking pool.
pub trait SecretStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Write several keys as one unit: either all new values land or the
    /// previous values are put back.
    ///
    /// The default writes key by key and restores earlier keys when a later
    /// write fails. Backends that can replace everything at once override it.
    fn write_entries(&self, entries: &[(&str, &str)]) -> Result<()> {
        let previous = entries
            .iter()
            .map(|(key, _)| self.read(key))
            .collect::<Result<Vec<_>>>()?;

        for (written, (key, value)) in entries.iter().enumerate() {
            if let Err(e) = self.write(key, value) {
                for ((key, _), old) in entries[..written].iter().zip(&previous) {
                    let restored = match old {
                        Some(old) => self.write(key, old),
                        None => self.remove(key),
                    };
                    if let Err(restore_err) = restored {
                        warn!(key = %key, error = %restore_err, "Failed to restore secret after partial write");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

/// OS keychain backend (macOS Keychain, Windows Credential Manager,
/// Secret Service).
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl SecretStorage for KeyringStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store secret in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete secret from keychain"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileContents {
    secrets: HashMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

/// JSON file backend, for hosts without a usable keychain.
pub struct FileStorage {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    /// When the file was last written, if it exists
    pub fn last_updated(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.load()?.updated_at)
    }

    fn load(&self) -> Result<FileContents> {
        let path = self.path();
        if !path.exists() {
            return Ok(FileContents::default());
        }
        let contents =
            std::fs::read_to_string(&path).context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    fn persist(&self, contents: &FileContents) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context("Failed to create credentials directory")?;
        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(contents)?;
        std::fs::write(&tmp, serialized).context("Failed to write credentials file")?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &path).context("Failed to replace credentials file")?;
        debug!(path = %path.display(), "Credentials file written");
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("Credentials file lock poisoned"))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict credentials file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

impl SecretStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.guard()?;
        Ok(self.load()?.secrets.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut contents = self.load()?;
        contents.secrets.insert(key.to_string(), value.to_string());
        contents.updated_at = Some(Utc::now());
        self.persist(&contents)
    }

    /// One rename replaces every key at once.
    fn write_entries(&self, entries: &[(&str, &str)]) -> Result<()> {
        let _guard = self.guard()?;
        let mut contents = self.load()?;
        for (key, value) in entries {
            contents.secrets.insert(key.to_string(), value.to_string());
        }
        contents.updated_at = Some(Utc::now());
        self.persist(&contents)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut contents = self.load()?;
        if contents.secrets.remove(key).is_none() {
            return Ok(());
        }
        if contents.secrets.is_empty() {
            let path = self.path();
            if path.exists() {
                std::fs::remove_file(path).context("Failed to remove credentials file")?;
            }
            return Ok(());
        }
        contents.updated_at = Some(Utc::now());
        self.persist(&contents)
    }
}

/// Process-local backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn secrets(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.secrets
            .lock()
            .map_err(|_| anyhow!("Memory storage lock poisoned"))
    }
}

impl SecretStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.secrets()?.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.secrets()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn write_entries(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut secrets = self.secrets()?;
        for (key, value) in entries {
            secrets.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.secrets()?.remove(key);
        Ok(())
    }
}
