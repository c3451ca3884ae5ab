//! Business logic services.
//!
//! Services contain core business logic separated from HTTP handlers.
//! They validate input, enforce invoice state rules and talk to the
//! payment processor through the gateway port.

pub mod invoice_service;
pub mod notifier;
pub mod reconciliation;
pub mod session;
