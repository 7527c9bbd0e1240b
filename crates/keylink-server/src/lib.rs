//! keylink Server - Axum-based HTTP server
//!
//! Exposes the device authorization flow as a JSON protocol and resolves
//! browser sessions established by the surrounding web application.

pub mod error;
pub mod http;
pub mod session;
pub mod state;

pub use error::ApiError;
pub use http::create_router;
pub use session::{HeaderSessionResolver, SessionResolver};
pub use state::AppState;
