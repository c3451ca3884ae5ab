//! Payment record models.
//!
//! A payment record is the store's snapshot of one processor payment intent
//! that passed reconciliation. The unique `external_reference` is the
//! idempotency key that keeps settlement at-most-once.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Represents a payment record from the database.
///
/// # Database Table
///
/// Maps to the `payments` table. Each payment:
/// - Belongs to exactly one invoice
/// - Has a unique processor reference (enforced by a UNIQUE index)
/// - Is never updated after insert; later settlement is tracked on the invoice
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct PaymentRecord {
    pub id: Uuid,

    /// Invoice this payment settles
    pub invoice_id: i64,

    /// Processor payment intent id (e.g. `pi_...`)
    pub external_reference: String,

    /// Amount the processor authorized, two decimal places
    pub amount: Decimal,

    /// Primary payment method kind reported by the processor ("card", "us_bank_account", ...)
    pub payment_method: String,

    /// Processor status at reconciliation time ("succeeded" or "processing")
    pub status: String,

    /// When funds were confirmed; `None` while the processor is still settling
    pub processed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a payment record.
#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub invoice_id: i64,
    pub external_reference: String,
    pub amount: Decimal,
    pub payment_method: String,
    pub status: String,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Response body for payment listings.
///
/// # JSON Example
///
/// ```json
/// {
///   "id": "770e8400-e29b-41d4-a716-446655440002",
///   "external_reference": "pi_3Nxyz",
///   "amount": "25.00",
///   "payment_method": "card",
///   "status": "succeeded",
///   "processed_at": "2026-03-01T16:00:00Z",
///   "created_at": "2026-03-01T16:00:00Z"
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub external_reference: String,
    pub amount: Decimal,
    pub payment_method: String,
    pub status: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<PaymentRecord> for PaymentResponse {
    fn from(payment: PaymentRecord) -> Self {
        Self {
            id: payment.id,
            external_reference: payment.external_reference,
            amount: payment.amount,
            payment_method: payment.payment_method,
            status: payment.status,
            processed_at: payment.processed_at,
            created_at: payment.created_at,
        }
    }
}
