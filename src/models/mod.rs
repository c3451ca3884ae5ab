//! Data models representing database entities.
//!
//! This module contains all data structures that map to database tables.

/// Invoice model and admin request types
pub mod invoice;
/// Recorded processor payments
pub mod payment;
