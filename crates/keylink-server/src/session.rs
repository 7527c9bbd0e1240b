//! Browser session resolution
//!
//! keylink does not log users in. The web application in front of it
//! authenticates the browser and forwards the user id; this module only reads
//! that result.

use async_trait::async_trait;
use axum::http::{header::InvalidHeaderName, HeaderMap, HeaderName};

/// Resolves the logged-in user for a request, if any
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn current_user(&self, headers: &HeaderMap) -> Option<String>;
}

/// Reads the user id from a header set by a trusted upstream gateway
///
/// The gateway must strip this header from inbound client requests.
#[derive(Debug, Clone)]
pub struct HeaderSessionResolver {
    header: HeaderName,
}

impl HeaderSessionResolver {
    pub fn new(header: &str) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            header: HeaderName::from_bytes(header.trim().to_ascii_lowercase().as_bytes())?,
        })
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

#[async_trait]
impl SessionResolver for HeaderSessionResolver {
    async fn current_user(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(str::to_string)
    }
}
