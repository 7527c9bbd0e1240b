//! Configuration types for keylink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Longest pairing lifetime accepted, in seconds (one day)
pub const MAX_PAIRING_TTL_SECS: u64 = 86_400;

/// A fixed-window request budget: at most `max_requests` per `window_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitPolicy {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl std::fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.window_secs)
    }
}

/// Parses `<max>/<seconds>`, e.g. `5/60`
impl std::str::FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (max, window) = s
            .split_once('/')
            .ok_or_else(|| format!("Invalid rate limit: {}. Use <max>/<seconds>, e.g. 5/60", s))?;
        let max_requests = max
            .trim()
            .parse()
            .map_err(|_| format!("Invalid request count in rate limit: {}", s))?;
        let window_secs = window
            .trim()
            .parse()
            .map_err(|_| format!("Invalid window in rate limit: {}", s))?;
        Ok(Self::new(max_requests, window_secs))
    }
}

/// Main configuration for keylink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the HTTP server on
    pub bind: String,
    /// Server port
    pub port: u16,
    /// How long a pairing request stays usable, in seconds
    pub pairing_ttl_secs: u64,
    /// Budget for `initiate`, keyed per client IP
    pub initiate_limit: RateLimitPolicy,
    /// Budget for `poll`, keyed per client IP
    pub poll_limit: RateLimitPolicy,
    /// Budget for `approve`, keyed per user
    pub approve_limit: RateLimitPolicy,
    /// Static tag issued keys start with (`<tag>_...`)
    pub api_key_tag: String,
    /// Label stored on keys minted through device pairing
    pub key_name: String,
    /// Store file location (platform config dir if None)
    pub data_path: Option<PathBuf>,
    /// Header the upstream web app sets to the logged-in user id
    pub session_header: String,
    /// Take the client IP from `X-Forwarded-For` (only behind a trusted proxy)
    pub trust_forwarded_for: bool,
    /// Background expiry sweep period in seconds (0 disables)
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            pairing_ttl_secs: 900,
            initiate_limit: RateLimitPolicy::new(5, 60),
            poll_limit: RateLimitPolicy::new(30, 60),
            approve_limit: RateLimitPolicy::new(10, 60),
            api_key_tag: "kl".to_string(),
            key_name: "Browser Extension".to_string(),
            data_path: None,
            session_header: "x-keylink-user".to_string(),
            trust_forwarded_for: false,
            sweep_interval_secs: 60,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set bind address
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set pairing lifetime
    pub fn with_pairing_ttl(mut self, secs: u64) -> Self {
        self.pairing_ttl_secs = secs;
        self
    }

    /// Builder pattern: set initiate budget
    pub fn with_initiate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.initiate_limit = policy;
        self
    }

    /// Builder pattern: set poll budget
    pub fn with_poll_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.poll_limit = policy;
        self
    }

    /// Builder pattern: set approve budget
    pub fn with_approve_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.approve_limit = policy;
        self
    }

    /// Builder pattern: set API key tag
    pub fn with_api_key_tag(mut self, tag: impl Into<String>) -> Self {
        self.api_key_tag = tag.into();
        self
    }

    /// Builder pattern: set issued key label
    pub fn with_key_name(mut self, name: impl Into<String>) -> Self {
        self.key_name = name.into();
        self
    }

    /// Builder pattern: set store file location
    pub fn with_data_path(mut self, path: Option<PathBuf>) -> Self {
        self.data_path = path;
        self
    }

    /// Builder pattern: set trusted session header
    pub fn with_session_header(mut self, header: impl Into<String>) -> Self {
        self.session_header = header.into();
        self
    }

    /// Builder pattern: trust proxy-supplied client addresses
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Builder pattern: set sweep interval
    pub fn with_sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    pub fn pairing_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Resolve the store file path (~/.config/keylink/store.json by default)
    pub fn resolve_data_path(&self) -> Result<PathBuf> {
        match &self.data_path {
            Some(path) => Ok(path.clone()),
            None => {
                let config_dir = dirs::config_dir()
                    .ok_or_else(|| Error::Config("configuration directory not found".into()))?;
                Ok(config_dir.join("keylink").join("store.json"))
            }
        }
    }

    /// Reject settings that would make the flow unusable
    pub fn validate(&self) -> Result<()> {
        if self.pairing_ttl_secs == 0 {
            return Err(Error::Config("pairing TTL must be positive".into()));
        }
        if self.pairing_ttl_secs > MAX_PAIRING_TTL_SECS {
            return Err(Error::Config(format!(
                "pairing TTL of {}s exceeds the maximum of {}s",
                self.pairing_ttl_secs, MAX_PAIRING_TTL_SECS
            )));
        }
        for (name, policy) in [
            ("initiate", self.initiate_limit),
            ("poll", self.poll_limit),
            ("approve", self.approve_limit),
        ] {
            if policy.max_requests == 0 || policy.window_secs == 0 {
                return Err(Error::Config(format!(
                    "{} rate limit must allow at least one request per non-empty window",
                    name
                )));
            }
        }
        if self.api_key_tag.is_empty()
            || !self.api_key_tag.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::Config(format!(
                "API key tag must be non-empty ASCII alphanumeric: {:?}",
                self.api_key_tag
            )));
        }
        if self.session_header.trim().is_empty() {
            return Err(Error::Config("session header must not be empty".into()));
        }
        Ok(())
    }
}
