//! Shared application state

use keylink_auth::DeviceAuthorizer;
use std::sync::Arc;

use crate::session::SessionResolver;

/// Shared application state
pub struct AppState {
    /// Device authorization flow
    pub authorizer: Arc<DeviceAuthorizer>,
    /// Resolves the logged-in user for browser requests
    pub sessions: Arc<dyn SessionResolver>,
    /// Whether `X-Forwarded-For` identifies the client
    pub trust_forwarded_for: bool,
}

impl AppState {
    /// Create a new application state
    pub fn new(
        authorizer: Arc<DeviceAuthorizer>,
        sessions: Arc<dyn SessionResolver>,
        trust_forwarded_for: bool,
    ) -> Self {
        Self {
            authorizer,
            sessions,
            trust_forwarded_for,
        }
    }
}
