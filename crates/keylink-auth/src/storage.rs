//! Persistent storage for pairing requests and API keys
//!
//! Uses a single JSON document (by default ~/.config/keylink/store.json)
//! cached in memory. Every mutation runs under the write lock and is written
//! through before the lock is released, so conditional updates are serialized
//! and a failed write leaves the previous state in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api_key::{ApiKey, ApiKeyId, ApiKeyStore};
use crate::pairing::{PairingId, PairingRequest, PairingStore};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Pairing already approved: {0}")]
    AlreadyApproved(String),
    #[error("Duplicate code for pairing {0}")]
    Duplicate(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Stored data structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    /// Pairing requests indexed by ID
    #[serde(default)]
    pairings: HashMap<String, PairingRequest>,
    /// Issued keys indexed by ID
    #[serde(default)]
    api_keys: HashMap<String, ApiKey>,
}

/// Write `contents` to `path`, readable only by the owner on unix
pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    // A leftover file keeps its old mode, so tighten it explicitly
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

/// JSON-file backed store for pairings and keys
pub struct JsonStore {
    /// Path to the storage file; None keeps everything in memory
    path: Option<PathBuf>,
    data: RwLock<StoredData>,
}

impl JsonStore {
    /// Create storage at a specific path, loading existing data if present
    pub async fn with_path(path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = if tokio::fs::try_exists(&path).await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            let data: StoredData = serde_json::from_str(&contents)?;
            info!(
                "Loaded store from {:?} ({} pairings, {} keys)",
                path,
                data.pairings.len(),
                data.api_keys.len()
            );
            data
        } else {
            debug!("No existing store at {:?}, creating new", path);
            StoredData::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Create a store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoredData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the given state to disk via a temp file and rename
    async fn persist(&self, data: &StoredData) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        write_private(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Saved store to {:?}", path);
        Ok(())
    }

    /// Apply `f` under the write lock and persist if it reports a change.
    ///
    /// If persisting fails the in-memory state is rolled back.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StoredData) -> StorageResult<(R, bool)>,
    ) -> StorageResult<R> {
        let mut data = self.data.write().await;
        let snapshot = self.path.as_ref().map(|_| data.clone());

        let (result, changed) = f(&mut *data)?;
        if changed {
            if let Err(e) = self.persist(&*data).await {
                warn!("Failed to persist store, rolling back: {}", e);
                if let Some(snapshot) = snapshot {
                    *data = snapshot;
                }
                return Err(e);
            }
        }
        Ok(result)
    }

    /// Number of pairing requests currently stored, expired or not
    pub async fn pairing_count(&self) -> usize {
        self.data.read().await.pairings.len()
    }

    /// Number of issued keys
    pub async fn api_key_count(&self) -> usize {
        self.data.read().await.api_keys.len()
    }
}

#[async_trait]
impl PairingStore for JsonStore {
    async fn insert_pairing(&self, request: PairingRequest) -> StorageResult<()> {
        let id = request.id.to_string();
        self.mutate(|data| {
            let clash = data.pairings.values().any(|p| {
                p.user_code == request.user_code || p.device_code == request.device_code
            });
            if clash || data.pairings.contains_key(&id) {
                return Err(StorageError::Duplicate(id.clone()));
            }
            data.pairings.insert(id.clone(), request);
            Ok(((), true))
        })
        .await?;
        debug!("Stored pairing {}", id);
        Ok(())
    }

    async fn find_by_user_code(&self, user_code: &str) -> StorageResult<Option<PairingRequest>> {
        let data = self.data.read().await;
        Ok(data
            .pairings
            .values()
            .find(|p| p.user_code == user_code)
            .cloned())
    }

    async fn find_by_device_code(
        &self,
        device_code: &str,
    ) -> StorageResult<Option<PairingRequest>> {
        let data = self.data.read().await;
        Ok(data
            .pairings
            .values()
            .find(|p| p.device_code == device_code)
            .cloned())
    }

    async fn mark_approved(&self, id: PairingId, user_id: &str) -> StorageResult<()> {
        let key = id.to_string();
        self.mutate(|data| {
            let pairing = data
                .pairings
                .get_mut(&key)
                .ok_or_else(|| StorageError::NotFound(key.clone()))?;
            if pairing.approved {
                return Err(StorageError::AlreadyApproved(key.clone()));
            }
            pairing.approved = true;
            pairing.user_id = Some(user_id.to_string());
            Ok(((), true))
        })
        .await
    }

    async fn delete_pairing(&self, id: PairingId) -> StorageResult<bool> {
        let key = id.to_string();
        self.mutate(|data| {
            let removed = data.pairings.remove(&key).is_some();
            Ok((removed, removed))
        })
        .await
    }

    async fn take_approved(&self, id: PairingId) -> StorageResult<Option<PairingRequest>> {
        let key = id.to_string();
        self.mutate(|data| {
            let approved = data
                .pairings
                .get(&key)
                .is_some_and(|p| p.approved && p.user_id.is_some());
            if !approved {
                return Ok((None, false));
            }
            Ok((data.pairings.remove(&key), true))
        })
        .await
    }

    async fn delete_expired_before(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let removed = self
            .mutate(|data| {
                let before = data.pairings.len();
                data.pairings.retain(|_, p| !p.is_expired(now));
                let removed = before - data.pairings.len();
                Ok((removed, removed > 0))
            })
            .await?;
        if removed > 0 {
            info!("Removed {} expired pairing request(s)", removed);
        }
        Ok(removed)
    }
}

#[async_trait]
impl ApiKeyStore for JsonStore {
    async fn insert_api_key(&self, key: ApiKey) -> StorageResult<()> {
        let id = key.id.to_string();
        self.mutate(|data| {
            data.api_keys.insert(id.clone(), key);
            Ok(((), true))
        })
        .await?;
        info!("Saved API key {}", id);
        Ok(())
    }

    async fn find_by_hash(&self, key_hash: &str) -> StorageResult<Option<ApiKey>> {
        let data = self.data.read().await;
        Ok(data
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<ApiKey>> {
        let data = self.data.read().await;
        let mut keys: Vec<ApiKey> = data
            .api_keys
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn touch_api_key(&self, id: ApiKeyId, at: DateTime<Utc>) -> StorageResult<()> {
        let key = id.to_string();
        self.mutate(|data| {
            let api_key = data
                .api_keys
                .get_mut(&key)
                .ok_or_else(|| StorageError::NotFound(key.clone()))?;
            api_key.last_used_at = Some(at);
            Ok(((), true))
        })
        .await
    }
}
