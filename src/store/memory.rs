//! In-memory implementation of the invoice store.
//!
//! Mirrors the PostgreSQL store's guarantees: each operation holds the write
//! lock for its whole check-then-write, which plays the role of the SQL
//! `WHERE` guards and the UNIQUE indexes.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{InvoiceStore, StoreError};
use crate::models::{
    invoice::{Invoice, InvoiceChanges, InvoiceStatus, NewInvoice},
    payment::{NewPaymentRecord, PaymentRecord},
};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    invoices: HashMap<i64, Invoice>,
    /// Keyed by external reference.
    payments: HashMap<String, PaymentRecord>,
}

/// A thread-safe in-memory invoice store.
///
/// Cloning shares the underlying maps.
#[derive(Debug, Default, Clone)]
pub struct InMemoryInvoiceStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_invoice(&self, id: i64) -> Result<Option<Invoice>, StoreError> {
        let state = self.state.read().await;
        Ok(state.invoices.get(&id).cloned())
    }

    async fn get_invoice_by_account(
        &self,
        account_number: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .values()
            .find(|invoice| invoice.account_number == account_number)
            .cloned())
    }

    async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state.invoices.values().cloned().collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(invoices)
    }

    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, StoreError> {
        let mut state = self.state.write().await;

        if state
            .invoices
            .values()
            .any(|existing| existing.account_number == invoice.account_number)
        {
            return Err(StoreError::DuplicateAccountNumber);
        }

        state.next_id += 1;
        let now = Utc::now();
        let created = Invoice {
            id: state.next_id,
            account_number: invoice.account_number,
            customer_name: invoice.customer_name,
            customer_email: invoice.customer_email,
            amount: invoice.amount,
            description: invoice.description,
            due_date: invoice.due_date,
            status: InvoiceStatus::Unpaid,
            created_at: now,
            updated_at: now,
        };
        state.invoices.insert(created.id, created.clone());

        Ok(created)
    }

    async fn update_invoice(
        &self,
        id: i64,
        changes: InvoiceChanges,
    ) -> Result<Invoice, StoreError> {
        let mut state = self.state.write().await;
        let invoice = state.invoices.get_mut(&id).ok_or(StoreError::NotFound)?;

        let touches_state = changes.amount.is_some() || changes.status.is_some();
        if invoice.status.is_terminal() || (touches_state && !invoice.status.is_payable()) {
            return Err(StoreError::InvoiceLocked(invoice.status));
        }

        if let Some(name) = changes.customer_name {
            invoice.customer_name = name;
        }
        if let Some(email) = changes.customer_email {
            invoice.customer_email = email;
        }
        if let Some(amount) = changes.amount {
            invoice.amount = amount;
        }
        if let Some(description) = changes.description {
            invoice.description = description;
        }
        if let Some(due_date) = changes.due_date {
            invoice.due_date = Some(due_date);
        }
        if let Some(status) = changes.status {
            invoice.status = status;
        }
        invoice.updated_at = Utc::now();

        Ok(invoice.clone())
    }

    async fn set_status(&self, id: i64, status: InvoiceStatus) -> Result<Invoice, StoreError> {
        let mut state = self.state.write().await;
        let invoice = state.invoices.get_mut(&id).ok_or(StoreError::NotFound)?;

        if invoice.status.is_terminal() {
            return if status == InvoiceStatus::Paid {
                Ok(invoice.clone())
            } else {
                Err(StoreError::InvoiceLocked(invoice.status))
            };
        }

        invoice.status = status;
        invoice.updated_at = Utc::now();
        Ok(invoice.clone())
    }

    async fn delete_invoice(&self, id: i64) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let invoice = state.invoices.get(&id).ok_or(StoreError::NotFound)?;

        let has_payments = state.payments.values().any(|p| p.invoice_id == id);
        if !invoice.status.is_payable() || has_payments {
            return Err(StoreError::InvoiceLocked(invoice.status));
        }

        state.invoices.remove(&id);
        Ok(())
    }

    async fn mark_overdue(&self, today: NaiveDate) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut updated = 0;

        for invoice in state.invoices.values_mut() {
            let past_due = invoice.due_date.is_some_and(|due| due < today);
            if invoice.status == InvoiceStatus::Unpaid && past_due {
                invoice.status = InvoiceStatus::Overdue;
                invoice.updated_at = now;
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn list_payments(&self, invoice_id: i64) -> Result<Vec<PaymentRecord>, StoreError> {
        let state = self.state.read().await;
        let mut payments: Vec<PaymentRecord> = state
            .payments
            .values()
            .filter(|payment| payment.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn find_payment_by_reference(
        &self,
        external_reference: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.payments.get(external_reference).cloned())
    }

    async fn insert_payment(
        &self,
        payment: NewPaymentRecord,
    ) -> Result<PaymentRecord, StoreError> {
        let mut state = self.state.write().await;

        if state.payments.contains_key(&payment.external_reference) {
            return Err(StoreError::DuplicateReference(payment.external_reference));
        }
        if !state.invoices.contains_key(&payment.invoice_id) {
            return Err(StoreError::NotFound);
        }

        let record = PaymentRecord {
            id: Uuid::new_v4(),
            invoice_id: payment.invoice_id,
            external_reference: payment.external_reference,
            amount: payment.amount,
            payment_method: payment.payment_method,
            status: payment.status,
            processed_at: payment.processed_at,
            created_at: Utc::now(),
        };
        state
            .payments
            .insert(record.external_reference.clone(), record.clone());

        Ok(record)
    }
}
