//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params, etc.)
//! 2. Calls into the services layer
//! 3. Returns HTTP response (JSON, status code)

/// Invoice administration endpoints
pub mod admin;
pub mod health;
/// Public invoice lookup
pub mod invoices;
/// Payment intent, reconciliation and processor webhook endpoints
pub mod payments;
