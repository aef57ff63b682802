//! Cached, durable holder of the current credential.
//!
//! The cache is loaded lazily on first access. Writers hold the cache lock
//! across the durable write, so readers observe either the whole old pair or
//! the whole new pair. Backend calls run on the blocking pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::storage::SecretStorage;
use super::Credential;

/// Durable key holding the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Durable key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

enum Cache {
    Unloaded,
    Loaded(Option<Credential>),
}

pub struct CredentialStore {
    storage: Arc<dyn SecretStorage>,
    cache: RwLock<Cache>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn SecretStorage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(Cache::Unloaded),
        }
    }

    /// Current credential, loading it from durable storage on first use.
    pub async fn get(&self) -> Result<Option<Credential>> {
        if let Cache::Loaded(ref credential) = *self.cache.read().await {
            return Ok(credential.clone());
        }

        let mut cache = self.cache.write().await;
        // Another task may have loaded it while we waited for the write lock
        if let Cache::Loaded(ref credential) = *cache {
            return Ok(credential.clone());
        }

        let credential = self.with_storage(load).await?;
        debug!(present = credential.is_some(), "Credential loaded from storage");
        *cache = Cache::Loaded(credential.clone());
        Ok(credential)
    }

    /// Replace the stored pair.
    pub async fn set(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let credential = Credential::new(access_token, refresh_token);
        let mut cache = self.cache.write().await;
        let pair = credential.clone();
        self.with_storage(move |storage| {
            storage.write_entries(&[
                (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
                (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
            ])
        })
        .await?;
        *cache = Cache::Loaded(Some(credential));
        info!("Credential stored");
        Ok(())
    }

    /// Forget the credential in memory and in durable storage.
    pub async fn clear(&self) -> Result<()> {
        let mut cache = self.cache.write().await;
        // Memory goes first so a failing backend still leaves us signed out
        *cache = Cache::Loaded(None);
        self.with_storage(|storage| {
            storage.remove(ACCESS_TOKEN_KEY)?;
            storage.remove(REFRESH_TOKEN_KEY)
        })
        .await?;
        info!("Credential cleared");
        Ok(())
    }

    pub async fn is_loaded(&self) -> bool {
        matches!(*self.cache.read().await, Cache::Loaded(_))
    }

    async fn with_storage<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn SecretStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || op(storage.as_ref()))
            .await
            .context("Credential storage task failed")?
    }
}

fn load(storage: &dyn SecretStorage) -> Result<Option<Credential>> {
    let access = storage.read(ACCESS_TOKEN_KEY)?;
    let refresh = storage.read(REFRESH_TOKEN_KEY)?;
    match (access, refresh) {
        (Some(access), Some(refresh)) => Ok(Some(Credential::new(access, refresh))),
        (None, None) => Ok(None),
        _ => {
            warn!("Incomplete credential in storage, treating as signed out");
            Ok(None)
        }
    }
}
