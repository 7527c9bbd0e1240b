//! Pairing requests and their store
//!
//! A pairing request links a short user code and a long device code to an
//! approval state. It is created pending, approved at most once, and then
//! either redeemed (deleted) by the device or left to expire.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageResult;

/// Unique identifier for a pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairingId(pub Uuid);

impl PairingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PairingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PairingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An in-flight pairing between a device and an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingRequest {
    pub id: PairingId,
    /// Short code the user confirms in the browser (`XXXX-XXXX`)
    pub user_code: String,
    /// Device-held secret used for polling
    pub device_code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved: bool,
    /// Approving account; set together with `approved`
    pub user_id: Option<String>,
    /// Name the device reported when it started pairing
    #[serde(default)]
    pub client_name: Option<String>,
}

impl PairingRequest {
    pub fn new(
        user_code: String,
        device_code: String,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
        client_name: Option<String>,
    ) -> Self {
        Self {
            id: PairingId::new(),
            user_code,
            device_code,
            created_at,
            expires_at: created_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            approved: false,
            user_id: None,
            client_name,
        }
    }

    /// Expired once `expires_at` lies strictly in the past; the expiry
    /// instant itself is still valid
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Seconds until expiry, clamped at zero
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Durable storage for pairing requests
///
/// Conditional operations must be atomic with respect to each other: two
/// concurrent `take_approved` calls for one id may not both return the record.
#[async_trait]
pub trait PairingStore: Send + Sync {
    async fn insert_pairing(&self, request: PairingRequest) -> StorageResult<()>;

    async fn find_by_user_code(&self, user_code: &str) -> StorageResult<Option<PairingRequest>>;

    async fn find_by_device_code(&self, device_code: &str)
        -> StorageResult<Option<PairingRequest>>;

    /// Approve a pending request for `user_id`
    ///
    /// Fails with `AlreadyApproved` rather than overwriting the owner.
    async fn mark_approved(&self, id: PairingId, user_id: &str) -> StorageResult<()>;

    /// Delete a request; returns whether it existed
    async fn delete_pairing(&self, id: PairingId) -> StorageResult<bool>;

    /// Remove and return the request only if it is still present and approved
    async fn take_approved(&self, id: PairingId) -> StorageResult<Option<PairingRequest>>;

    /// Delete every request whose expiry is before `now`
    async fn delete_expired_before(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(now: DateTime<Utc>) -> PairingRequest {
        PairingRequest::new(
            "ABCD-EFGH".into(),
            "00".repeat(32),
            now,
            Duration::minutes(15),
            None,
        )
    }

    #[test]
    fn test_new_request_is_pending() {
        let now = Utc::now();
        let req = request(now);
        assert!(!req.approved);
        assert!(req.user_id.is_none());
        assert_eq!(req.expires_at, now + Duration::minutes(15));
        assert_eq!(req.expires_in(now), 900);
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let req = request(now);
        assert!(!req.is_expired(now + Duration::minutes(15) - Duration::seconds(1)));
        assert!(!req.is_expired(now + Duration::minutes(15)));
        assert!(req.is_expired(now + Duration::minutes(15) + Duration::milliseconds(1)));
        assert_eq!(req.expires_in(now + Duration::hours(1)), 0);
    }

    #[test]
    fn test_oversized_ttl_saturates() {
        let now = Utc::now();
        let req = PairingRequest::new(
            "ABCD-EFGH".into(),
            "00".repeat(32),
            now,
            Duration::MAX,
            None,
        );
        assert_eq!(req.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!req.is_expired(now));
        assert!(req.expires_in(now) > 0);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(PairingId::new(), PairingId::new());
    }
}
