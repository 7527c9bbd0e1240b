//! keylink Auth - Device authorization and API key issuance
//!
//! Lets a detached client (e.g. a browser extension) obtain a long-lived API
//! key by pairing with a browser session that is already logged in.
//!
//! # Pairing Flow
//!
//! 1. Device calls `DeviceAuthorizer::initiate()` and receives a user code
//!    (`XXXX-XXXX`) and a secret device code, valid for 15 minutes
//! 2. The user code is shown to the person, who confirms it in the browser
//! 3. The browser session calls `DeviceAuthorizer::approve()`
//! 4. Device polls `DeviceAuthorizer::poll()` with its device code and
//!    receives the raw API key exactly once
//!
//! # Example
//!
//! ```no_run
//! use keylink_auth::{
//!     CredentialGenerator, DeviceAuthSettings, DeviceAuthorizer, FixedWindowLimiter,
//!     JsonStore, KeyHasher, OsRandom, SystemClock,
//! };
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let store = Arc::new(JsonStore::in_memory());
//!     let clock = Arc::new(SystemClock);
//!     let credentials = CredentialGenerator::new(
//!         Arc::new(OsRandom),
//!         KeyHasher::new(b"deployment secret").unwrap(),
//!         "kl",
//!     );
//!     let authorizer = DeviceAuthorizer::new(
//!         store.clone(),
//!         store,
//!         Arc::new(FixedWindowLimiter::new(clock.clone())),
//!         credentials,
//!         clock,
//!         DeviceAuthSettings::default(),
//!     );
//!
//!     let start = authorizer.initiate("203.0.113.7", None).await.unwrap();
//!     println!("Confirm code {} in your browser", start.user_code);
//!
//!     // Later, from the logged-in browser session
//!     authorizer.approve(Some("user-1"), &start.user_code).await.unwrap();
//!
//!     // And from the device
//!     let poll = authorizer.poll("203.0.113.7", &start.device_code).await.unwrap();
//!     assert!(poll.api_key.is_some());
//! }
//! ```

pub mod api_key;
pub mod clock;
pub mod credential;
pub mod device_auth;
pub mod pairing;
pub mod rate_limit;
pub mod storage;

pub use api_key::{ApiKey, ApiKeyId, ApiKeyInfo, ApiKeyStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{
    is_valid_user_code_format, normalize_user_code, CredentialError, CredentialGenerator,
    KeyHasher, OsRandom, RandomSource, SeededRandom, USER_CODE_ALPHABET,
};
pub use device_auth::{
    DeviceAuthError, DeviceAuthResult, DeviceAuthSettings, DeviceAuthorizer, InitiateResponse,
    PollResponse, PAIRING_VALIDITY_SECONDS, POLL_INTERVAL_SECONDS,
};
pub use pairing::{PairingId, PairingRequest, PairingStore};
pub use rate_limit::{
    FixedWindowLimiter, RateLimitDecision, RateLimiter, DEFAULT_MAX_TRACKED_KEYS,
};
pub use storage::{JsonStore, StorageError, StorageResult};
