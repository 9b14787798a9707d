//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. Every route except
//! [`health::health`] and the `/ws` upgrade requires authentication via
//! [`crate::auth::require_api_key`].

pub mod events;
pub mod health;
pub mod sessions;
