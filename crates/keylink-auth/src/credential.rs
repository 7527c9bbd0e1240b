//! Credential generation and verification
//!
//! Produces the three secrets used by device authorization:
//! 1. User code: `XXXX-XXXX` over a 32-symbol alphabet, shown to a person
//! 2. Device code: 32 random bytes, hex encoded, held only by the device
//! 3. API key: `<tag>_<base64url>` bearer credential issued after pairing
//!
//! Only the keyed HMAC-SHA256 digest and a short display prefix of an API key
//! are ever persisted.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::Sha256;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::write_private;

type HmacSha256 = Hmac<Sha256>;

/// User code alphabet: uppercase letters and digits without 0/O and 1/I
pub const USER_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of symbols in a user code, excluding the separator
pub const USER_CODE_SYMBOLS: usize = 8;

/// Random bytes behind a device code (hex encodes to 64 chars)
pub const DEVICE_CODE_BYTES: usize = 32;

/// Random bytes behind an API key
pub const API_KEY_BYTES: usize = 32;

/// Random characters kept in a key's display prefix, after `<tag>_`
pub const KEY_PREFIX_RANDOM_CHARS: usize = 8;

const HASH_SECRET_BYTES: usize = 32;

/// Credential errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid hashing secret: {0}")]
    InvalidSecret(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Injected source of secure randomness
pub trait RandomSource: Send + Sync {
    fn fill_bytes(&self, dest: &mut [u8]);
}

/// Operating system CSPRNG
///
/// Panics if the OS entropy source is unavailable, which is not recoverable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

/// Deterministic generator for tests. Never use for real credentials.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        self.rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fill_bytes(dest);
    }
}

/// Keyed one-way digest for API keys
#[derive(Clone)]
pub struct KeyHasher {
    mac: HmacSha256,
}

impl std::fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyHasher(..)")
    }
}

impl KeyHasher {
    /// Create a hasher keyed by a deployment secret
    pub fn new(secret: &[u8]) -> Result<Self, CredentialError> {
        if secret.is_empty() {
            return Err(CredentialError::InvalidSecret("secret is empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| CredentialError::InvalidSecret(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Load the secret from `path`, creating it on first run
    ///
    /// The file holds the hex-encoded secret. Hashes of issued keys are only
    /// verifiable with the same secret, so it must survive restarts.
    pub async fn load_or_create(
        path: &Path,
        random: &dyn RandomSource,
    ) -> Result<Self, CredentialError> {
        if tokio::fs::try_exists(path).await? {
            let contents = tokio::fs::read_to_string(path).await?;
            let secret = hex::decode(contents.trim())
                .map_err(|e| CredentialError::InvalidSecret(e.to_string()))?;
            debug!("Loaded hashing secret from {:?}", path);
            return Self::new(&secret);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut secret = [0u8; HASH_SECRET_BYTES];
        random.fill_bytes(&mut secret);
        write_private(path, hex::encode(secret).as_bytes()).await?;
        info!("Generated new hashing secret at {:?}", path);
        Self::new(&secret)
    }

    /// Hex-encoded HMAC-SHA256 of `secret`
    pub fn hash(&self, secret: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(secret.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of `secret` against a stored hex digest
    pub fn verify(&self, secret: &str, stored_hash: &str) -> bool {
        let Ok(expected) = hex::decode(stored_hash) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(secret.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

/// Mints user codes, device codes and API keys
#[derive(Clone)]
pub struct CredentialGenerator {
    random: Arc<dyn RandomSource>,
    hasher: KeyHasher,
    tag: String,
}

impl CredentialGenerator {
    pub fn new(random: Arc<dyn RandomSource>, hasher: KeyHasher, tag: impl Into<String>) -> Self {
        Self {
            random,
            hasher,
            tag: tag.into(),
        }
    }

    /// Generate a user code formatted as `XXXX-XXXX`
    pub fn user_code(&self) -> String {
        let mut bytes = [0u8; USER_CODE_SYMBOLS];
        self.random.fill_bytes(&mut bytes);

        let mut code = String::with_capacity(USER_CODE_SYMBOLS + 1);
        for (i, byte) in bytes.iter().enumerate() {
            if i == USER_CODE_SYMBOLS / 2 {
                code.push('-');
            }
            // 256 is a multiple of 32, so masking keeps the draw uniform
            code.push(USER_CODE_ALPHABET[(byte & 0x1f) as usize] as char);
        }
        code
    }

    /// Generate a 64-character lowercase hex device code
    pub fn device_code(&self) -> String {
        let mut bytes = [0u8; DEVICE_CODE_BYTES];
        self.random.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Generate a raw API key `<tag>_<random>`
    pub fn api_key(&self) -> String {
        let mut bytes = [0u8; API_KEY_BYTES];
        self.random.fill_bytes(&mut bytes);
        format!("{}_{}", self.tag, URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn hash(&self, secret: &str) -> String {
        self.hasher.hash(secret)
    }

    pub fn verify(&self, secret: &str, stored_hash: &str) -> bool {
        self.hasher.verify(secret, stored_hash)
    }

    /// Leading slice of a key that is safe to display
    pub fn prefix(&self, secret: &str) -> String {
        secret
            .chars()
            .take(self.tag.len() + 1 + KEY_PREFIX_RANDOM_CHARS)
            .collect()
    }

    /// Whether `secret` carries this deployment's key tag
    pub fn looks_like_api_key(&self, secret: &str) -> bool {
        secret
            .strip_prefix(self.tag.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .is_some_and(|random| !random.is_empty())
    }
}

/// Check that `code` is `XXXX-XXXX` over [`USER_CODE_ALPHABET`]
pub fn is_valid_user_code_format(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == USER_CODE_SYMBOLS + 1
        && bytes.iter().enumerate().all(|(i, b)| {
            if i == USER_CODE_SYMBOLS / 2 {
                *b == b'-'
            } else {
                USER_CODE_ALPHABET.contains(b)
            }
        })
}

/// Canonicalize a typed user code: trims, uppercases, drops inner spaces and
/// inserts the dash if it was left out. Returns None if the result is not a
/// well-formed code.
pub fn normalize_user_code(input: &str) -> Option<String> {
    let mut code: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if code.len() == USER_CODE_SYMBOLS && !code.contains('-') {
        code.insert(USER_CODE_SYMBOLS / 2, '-');
    }
    is_valid_user_code_format(&code).then_some(code)
}
