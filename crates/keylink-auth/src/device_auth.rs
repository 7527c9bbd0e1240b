//! Device authorization flow
//!
//! Lets a detached client obtain an API key by pairing with a logged-in
//! browser session:
//! 1. Device calls [`DeviceAuthorizer::initiate`] and receives a user code and
//!    a device code valid for 15 minutes
//! 2. The user, logged in elsewhere, confirms the user code via
//!    [`DeviceAuthorizer::approve`]
//! 3. Device calls [`DeviceAuthorizer::poll`] with its device code until the
//!    pairing is approved, then receives a freshly minted API key exactly once
//!
//! Redeeming an approved pairing removes it atomically before the key is
//! minted, so concurrent polls cannot both receive a key.

use chrono::Duration;
use keylink_core::{Config, RateLimitPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api_key::{ApiKey, ApiKeyInfo, ApiKeyStore};
use crate::clock::Clock;
use crate::credential::{normalize_user_code, CredentialGenerator};
use crate::pairing::{PairingRequest, PairingStore};
use crate::rate_limit::RateLimiter;
use crate::storage::StorageError;

/// Default pairing validity in seconds
pub const PAIRING_VALIDITY_SECONDS: i64 = 900;

/// Suggested delay between device polls, in seconds
pub const POLL_INTERVAL_SECONDS: u64 = 5;

/// Attempts at minting codes that do not collide with a stored pairing
const MAX_CODE_ATTEMPTS: usize = 3;

/// Device authorization errors
#[derive(Debug, Error)]
pub enum DeviceAuthError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("Code not found")]
    NotFound,
    #[error("Code already approved")]
    AlreadyApproved,
    #[error("Code expired")]
    Expired,
    #[error("Too many requests, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type DeviceAuthResult<T> = Result<T, DeviceAuthError>;

/// Response when a device starts pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    /// Code shown to the user for confirmation
    pub user_code: String,
    /// Secret the device polls with; never displayed
    pub device_code: String,
    /// Seconds until the pairing expires
    pub expires_in: i64,
    /// Suggested seconds between polls
    pub interval: u64,
}

/// Response to a device poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub approved: bool,
    /// Raw API key, present only on the single successful redemption
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl PollResponse {
    pub fn pending() -> Self {
        Self {
            approved: false,
            api_key: None,
        }
    }
}

/// Tunables for the flow
#[derive(Debug, Clone)]
pub struct DeviceAuthSettings {
    pub pairing_ttl: Duration,
    pub initiate_limit: RateLimitPolicy,
    pub poll_limit: RateLimitPolicy,
    pub approve_limit: RateLimitPolicy,
    /// Label for keys when the device did not name itself
    pub key_name: String,
}

impl Default for DeviceAuthSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            pairing_ttl: Duration::seconds(PAIRING_VALIDITY_SECONDS),
            initiate_limit: config.initiate_limit,
            poll_limit: config.poll_limit,
            approve_limit: config.approve_limit,
            key_name: config.key_name,
        }
    }
}

impl TryFrom<&Config> for DeviceAuthSettings {
    type Error = keylink_core::Error;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let pairing_ttl = i64::try_from(config.pairing_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .filter(|ttl| *ttl > Duration::zero())
            .ok_or_else(|| {
                keylink_core::Error::Config(format!(
                    "pairing TTL out of range: {}s",
                    config.pairing_ttl_secs
                ))
            })?;
        Ok(Self {
            pairing_ttl,
            initiate_limit: config.initiate_limit,
            poll_limit: config.poll_limit,
            approve_limit: config.approve_limit,
            key_name: config.key_name.clone(),
        })
    }
}

/// Orchestrates pairing, approval and key issuance
pub struct DeviceAuthorizer {
    pairings: Arc<dyn PairingStore>,
    api_keys: Arc<dyn ApiKeyStore>,
    limiter: Arc<dyn RateLimiter>,
    credentials: CredentialGenerator,
    clock: Arc<dyn Clock>,
    settings: DeviceAuthSettings,
}

impl DeviceAuthorizer {
    pub fn new(
        pairings: Arc<dyn PairingStore>,
        api_keys: Arc<dyn ApiKeyStore>,
        limiter: Arc<dyn RateLimiter>,
        credentials: CredentialGenerator,
        clock: Arc<dyn Clock>,
        settings: DeviceAuthSettings,
    ) -> Self {
        Self {
            pairings,
            api_keys,
            limiter,
            credentials,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &DeviceAuthSettings {
        &self.settings
    }

    async fn enforce(&self, key: String, policy: RateLimitPolicy) -> DeviceAuthResult<()> {
        let decision = self
            .limiter
            .check(&key, policy.window(), policy.max_requests)
            .await;
        if decision.allowed {
            return Ok(());
        }
        let retry_after = decision.retry_after.unwrap_or(policy.window_secs);
        warn!(key = %key, retry_after, "Rate limit exceeded");
        Err(DeviceAuthError::RateLimited { retry_after })
    }

    /// Start a pairing for an unauthenticated device
    pub async fn initiate(
        &self,
        client_ip: &str,
        client_name: Option<String>,
    ) -> DeviceAuthResult<InitiateResponse> {
        self.enforce(format!("device-auth:{}", client_ip), self.settings.initiate_limit)
            .await?;

        self.sweep_expired().await?;

        let client_name = client_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let now = self.clock.now();
        let mut attempt = 0;
        let request = loop {
            attempt += 1;
            let request = PairingRequest::new(
                self.credentials.user_code(),
                self.credentials.device_code(),
                now,
                self.settings.pairing_ttl,
                client_name.clone(),
            );
            match self.pairings.insert_pairing(request.clone()).await {
                Ok(()) => break request,
                Err(StorageError::Duplicate(_)) if attempt < MAX_CODE_ATTEMPTS => {
                    debug!("Generated code collided with a stored pairing, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(pairing = %request.id, "Started device pairing");

        Ok(InitiateResponse {
            expires_in: request.expires_in(now),
            user_code: request.user_code,
            device_code: request.device_code,
            interval: POLL_INTERVAL_SECONDS,
        })
    }

    /// Approve a pending pairing on behalf of an authenticated user
    ///
    /// `user_id` is None when the caller has no session.
    pub async fn approve(&self, user_id: Option<&str>, user_code: &str) -> DeviceAuthResult<()> {
        let user_id = user_id
            .filter(|id| !id.is_empty())
            .ok_or(DeviceAuthError::Unauthorized)?;

        if user_code.trim().is_empty() {
            return Err(DeviceAuthError::InvalidRequest("userCode is required".into()));
        }
        let user_code = normalize_user_code(user_code)
            .ok_or_else(|| DeviceAuthError::InvalidRequest("malformed userCode".into()))?;

        self.enforce(
            format!("device-auth-approve:{}", user_id),
            self.settings.approve_limit,
        )
        .await?;

        let request = self
            .pairings
            .find_by_user_code(&user_code)
            .await?
            .ok_or(DeviceAuthError::NotFound)?;

        if request.is_expired(self.clock.now()) {
            debug!(pairing = %request.id, "Approval attempted on expired pairing");
            return Err(DeviceAuthError::Expired);
        }
        if request.approved {
            warn!(pairing = %request.id, "Repeated approval attempt");
            return Err(DeviceAuthError::AlreadyApproved);
        }

        match self.pairings.mark_approved(request.id, user_id).await {
            Ok(()) => {}
            Err(StorageError::AlreadyApproved(_)) => return Err(DeviceAuthError::AlreadyApproved),
            Err(StorageError::NotFound(_)) => return Err(DeviceAuthError::NotFound),
            Err(e) => return Err(e.into()),
        }

        info!(pairing = %request.id, user_id, "Device pairing approved");
        Ok(())
    }

    /// Check a pairing from the device side, issuing the key once approved
    pub async fn poll(&self, client_ip: &str, device_code: &str) -> DeviceAuthResult<PollResponse> {
        let device_code = device_code.trim();
        if device_code.is_empty() {
            return Err(DeviceAuthError::InvalidRequest("deviceCode is required".into()));
        }

        self.enforce(format!("device-auth-poll:{}", client_ip), self.settings.poll_limit)
            .await?;

        let request = self
            .pairings
            .find_by_device_code(device_code)
            .await?
            .ok_or(DeviceAuthError::NotFound)?;

        if request.is_expired(self.clock.now()) {
            self.pairings.delete_pairing(request.id).await?;
            debug!(pairing = %request.id, "Removed expired pairing on poll");
            return Err(DeviceAuthError::Expired);
        }
        if !request.approved {
            return Ok(PollResponse::pending());
        }

        // Only the caller that removes the record may mint a key
        let Some(redeemed) = self.pairings.take_approved(request.id).await? else {
            return Err(DeviceAuthError::NotFound);
        };
        let Some(user_id) = redeemed.user_id else {
            return Err(DeviceAuthError::NotFound);
        };

        let raw_key = self.credentials.api_key();
        let name = redeemed
            .client_name
            .unwrap_or_else(|| self.settings.key_name.clone());
        let key = ApiKey::new(
            user_id,
            name,
            self.credentials.hash(&raw_key),
            self.credentials.prefix(&raw_key),
            self.clock.now(),
        );
        let (key_id, key_prefix, owner) = (key.id, key.key_prefix.clone(), key.user_id.clone());

        if let Err(e) = self.api_keys.insert_api_key(key).await {
            // Restore the pairing so the device can retry the redemption
            let mut restored = request;
            restored.user_id = Some(owner);
            if let Err(restore_err) = self.pairings.insert_pairing(restored).await {
                warn!("Failed to restore pairing after key storage error: {}", restore_err);
            }
            return Err(e.into());
        }

        info!(
            pairing = %redeemed.id,
            key = %key_id,
            key_prefix = %key_prefix,
            user_id = %owner,
            "Issued API key for paired device"
        );

        Ok(PollResponse {
            approved: true,
            api_key: Some(raw_key),
        })
    }

    /// Resolve a presented raw key to its stored record
    pub async fn authenticate(&self, raw_key: &str) -> DeviceAuthResult<ApiKey> {
        if !self.credentials.looks_like_api_key(raw_key) {
            return Err(DeviceAuthError::Unauthorized);
        }
        let key = self
            .api_keys
            .find_by_hash(&self.credentials.hash(raw_key))
            .await?
            .ok_or(DeviceAuthError::Unauthorized)?;

        if !self.credentials.verify(raw_key, &key.key_hash) {
            return Err(DeviceAuthError::Unauthorized);
        }

        let now = self.clock.now();
        self.api_keys.touch_api_key(key.id, now).await?;
        Ok(ApiKey {
            last_used_at: Some(now),
            ..key
        })
    }

    /// List a user's keys without their hashes
    pub async fn list_keys(&self, user_id: &str) -> DeviceAuthResult<Vec<ApiKeyInfo>> {
        let keys = self.api_keys.list_for_user(user_id).await?;
        Ok(keys.iter().map(ApiKeyInfo::from).collect())
    }

    /// Delete expired pairing requests
    pub async fn sweep_expired(&self) -> DeviceAuthResult<usize> {
        Ok(self.pairings.delete_expired_before(self.clock.now()).await?)
    }
}
