//! Invoice store: durable record of invoices and recorded payments.
//!
//! The store is the single source of truth for invoice amount and status.
//! Its guarantees carry the concurrency story of the whole service:
//!
//! - `insert_payment` rejects a duplicate `external_reference` atomically
//! - admin writes (`update_invoice`, `delete_invoice`) never touch a paid invoice
//! - `set_status` never moves an invoice out of `paid`

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{
    invoice::{Invoice, InvoiceChanges, InvoiceStatus, NewInvoice},
    payment::{NewPaymentRecord, PaymentRecord},
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryInvoiceStore;
pub use postgres::PgInvoiceStore;

/// Errors returned by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invoice not found")]
    NotFound,

    /// The invoice's status forbids the requested write.
    ///
    /// Paid invoices reject every admin write; processing invoices reject
    /// amount and status edits and deletion.
    #[error("Invoice is {0} and cannot be modified")]
    InvoiceLocked(InvoiceStatus),

    #[error("Account number already exists")]
    DuplicateAccountNumber,

    /// A payment record with this processor reference already exists.
    #[error("Payment reference {0} already recorded")]
    DuplicateReference(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage contract consumed by the reconciliation engine and admin services.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Check connectivity to the backing store.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_invoice(&self, id: i64) -> Result<Option<Invoice>, StoreError>;

    async fn get_invoice_by_account(
        &self,
        account_number: &str,
    ) -> Result<Option<Invoice>, StoreError>;

    /// All invoices, newest first.
    async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError>;

    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, StoreError>;

    /// Apply admin edits.
    ///
    /// Fails with `InvoiceLocked` when the invoice is paid, or when the
    /// changes touch the amount or status while the invoice is processing.
    async fn update_invoice(&self, id: i64, changes: InvoiceChanges)
    -> Result<Invoice, StoreError>;

    /// Move an invoice to `status`. A paid invoice stays paid: setting it to
    /// `paid` again is a no-op, anything else fails with `InvoiceLocked`.
    async fn set_status(&self, id: i64, status: InvoiceStatus) -> Result<Invoice, StoreError>;

    /// Delete an unpaid or overdue invoice with no recorded payments.
    async fn delete_invoice(&self, id: i64) -> Result<(), StoreError>;

    /// Flip unpaid invoices due before `today` to overdue. Returns how many changed.
    async fn mark_overdue(&self, today: NaiveDate) -> Result<u64, StoreError>;

    async fn list_payments(&self, invoice_id: i64) -> Result<Vec<PaymentRecord>, StoreError>;

    async fn find_payment_by_reference(
        &self,
        external_reference: &str,
    ) -> Result<Option<PaymentRecord>, StoreError>;

    /// Insert a payment record.
    ///
    /// Fails with `DuplicateReference` when the reference is already
    /// recorded. The check and insert are one atomic step.
    async fn insert_payment(&self, payment: NewPaymentRecord)
    -> Result<PaymentRecord, StoreError>;
}
