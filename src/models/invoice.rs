//! Invoice data models and API request/response types.
//!
//! This module defines:
//! - `Invoice`: Database entity representing a billable record
//! - `InvoiceStatus`: Lifecycle state of an invoice
//! - Request types for admin create/update operations
//! - `PublicInvoiceView` and `InvoiceResponse`: Bodies returned to clients

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an invoice.
///
/// # Transitions
///
/// - `unpaid` / `overdue` → `processing` (delayed settlement, e.g. bank debit)
/// - `unpaid` / `overdue` / `processing` → `paid`
/// - `unpaid` ↔ `overdue` (admin edit or overdue sweep)
///
/// `paid` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "invoice_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Unpaid,
    Overdue,
    Processing,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Paid => "paid",
        }
    }

    /// Paid invoices can no longer be edited or deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid)
    }

    /// Whether a customer may start a new payment for the invoice.
    ///
    /// A processing invoice already has a payment in flight.
    pub fn is_payable(&self) -> bool {
        matches!(self, InvoiceStatus::Unpaid | InvoiceStatus::Overdue)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents an invoice record from the database.
///
/// # Database Table
///
/// Maps to the `invoices` table. Each invoice:
/// - Has a numeric id and a unique, human-facing account number
/// - Stores its amount as `NUMERIC(12,2)` (never floats)
/// - Carries a status that only the reconciliation engine moves past `overdue`
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct Invoice {
    /// Unique identifier for this invoice
    pub id: i64,

    /// Account number customers use to look the invoice up
    pub account_number: String,

    pub customer_name: String,

    /// Only visible to admins
    pub customer_email: String,

    /// Amount owed, two decimal places
    pub amount: Decimal,

    pub description: String,

    pub due_date: Option<NaiveDate>,

    pub status: InvoiceStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Amount in minor units (cents), the unit payment processors work in.
    ///
    /// Returns `None` if the amount does not fit in an `i64`.
    pub fn amount_minor_units(&self) -> Option<i64> {
        to_minor_units(self.amount)
    }
}

/// Convert a decimal amount to minor units, rounding half away from zero.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Convert minor units (cents) back to a two-place decimal amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Fields needed to insert a new invoice.
///
/// New invoices always start `unpaid`.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub account_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub amount: Decimal,
    pub description: String,
    pub due_date: Option<NaiveDate>,
}

/// Partial update applied by an admin. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct InvoiceChanges {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub amount: Option<Decimal>,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub status: Option<InvoiceStatus>,
}

/// Request body for creating a new invoice.
///
/// # JSON Example
///
/// ```json
/// {
///   "account_number": "ACC-1001",
///   "customer_name": "Jane Doe",
///   "customer_email": "jane@example.com",
///   "amount": "150.00",
///   "description": "Lawn care, March",
///   "due_date": "2026-04-01"
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub account_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    pub due_date: Option<NaiveDate>,
}

/// Request body for editing an invoice. All fields are optional.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateInvoiceRequest {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub amount: Option<Decimal>,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub status: Option<InvoiceStatus>,
}

/// Reduced view returned by the public lookup endpoint.
///
/// Never carries the customer email or audit timestamps.
#[derive(Debug, Serialize)]
pub struct PublicInvoiceView {
    pub id: i64,
    pub account_number: String,
    pub customer_name: String,
    pub amount: Decimal,
    pub description: String,
    pub due_date: Option<NaiveDate>,
    pub status: InvoiceStatus,
}

impl From<Invoice> for PublicInvoiceView {
    fn from(invoice: Invoice) -> Self {
        Self {
            id: invoice.id,
            account_number: invoice.account_number,
            customer_name: invoice.customer_name,
            amount: invoice.amount,
            description: invoice.description,
            due_date: invoice.due_date,
            status: invoice.status,
        }
    }
}

/// Full invoice view returned to admins.
#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub id: i64,
    pub account_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub amount: Decimal,
    pub description: String,
    pub due_date: Option<NaiveDate>,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Invoice> for InvoiceResponse {
    fn from(invoice: Invoice) -> Self {
        Self {
            id: invoice.id,
            account_number: invoice.account_number,
            customer_name: invoice.customer_name,
            customer_email: invoice.customer_email,
            amount: invoice.amount,
            description: invoice.description,
            due_date: invoice.due_date,
            status: invoice.status,
            created_at: invoice.created_at,
            updated_at: invoice.updated_at,
        }
    }
}
