//! Issued API keys
//!
//! Only the keyed hash and a display prefix of a key are kept; the raw secret
//! exists solely in the response that delivers it to the device.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageResult;

/// Unique identifier for an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiKeyId(pub Uuid);

impl ApiKeyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApiKeyId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApiKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted API credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    /// Owning account
    pub user_id: String,
    /// Human label, e.g. the client application name
    pub name: String,
    /// Keyed one-way digest of the raw key
    pub key_hash: String,
    /// Leading characters of the raw key, for display
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn new(
        user_id: String,
        name: String,
        key_hash: String,
        key_prefix: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ApiKeyId::new(),
            user_id,
            name,
            key_hash,
            key_prefix,
            created_at,
            last_used_at: None,
        }
    }
}

/// Display-safe view of a key for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    pub id: String,
    pub name: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&ApiKey> for ApiKeyInfo {
    fn from(key: &ApiKey) -> Self {
        Self {
            id: key.id.to_string(),
            name: key.name.clone(),
            key_prefix: key.key_prefix.clone(),
            created_at: key.created_at,
            last_used_at: key.last_used_at,
        }
    }
}

/// Durable storage for issued keys
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert_api_key(&self, key: ApiKey) -> StorageResult<()>;

    async fn find_by_hash(&self, key_hash: &str) -> StorageResult<Option<ApiKey>>;

    async fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<ApiKey>>;

    /// Record a successful use of the key
    async fn touch_api_key(&self, id: ApiKeyId, at: DateTime<Utc>) -> StorageResult<()>;
}
