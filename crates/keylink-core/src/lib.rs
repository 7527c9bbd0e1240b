//! keylink Core - Shared configuration and error types
//!
//! This crate provides the foundational types used across all keylink components.

pub mod config;
pub mod error;

pub use config::{Config, RateLimitPolicy, MAX_PAIRING_TTL_SECS};
pub use error::{Error, Result};
