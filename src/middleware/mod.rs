//! HTTP middleware components.
//!
//! Middleware are functions that run before route handlers.
//! They can authenticate requests and short-circuit the ones that fail.

/// Admin session middleware
pub mod auth;
