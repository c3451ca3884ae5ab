//! Invoice service - admin CRUD and public lookup.
//!
//! This service handles:
//! - Validating admin input before it reaches the store
//! - Dispatching the invoice-created notification
//! - Restricting admin status edits to `unpaid` / `overdue`
//! - The overdue sweep
//!
//! Terminal immutability of paid invoices is enforced by the store itself;
//! this layer only adds input validation on top.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::{
    error::AppError,
    models::{
        invoice::{
            CreateInvoiceRequest, Invoice, InvoiceChanges, InvoiceStatus, NewInvoice,
            UpdateInvoiceRequest,
        },
        payment::PaymentRecord,
    },
    services::notifier::{InvoiceNotifier, dispatch_invoice_created},
    store::{InvoiceStore, StoreError},
};

const MAX_ACCOUNT_NUMBER_LEN: usize = 64;

/// Largest amount a `NUMERIC(12,2)` column holds.
fn max_amount() -> Decimal {
    Decimal::new(999_999_999_999, 2)
}

/// Create an invoice and notify the customer.
///
/// # Process
///
/// 1. Validate and normalize the request
/// 2. Insert the invoice (status `unpaid`)
/// 3. Spawn the invoice-created notification (failure does not fail creation)
///
/// # Errors
///
/// - `InvalidRequest`: a field failed validation
/// - `Store(DuplicateAccountNumber)`: account number already used
pub async fn create_invoice(
    store: &dyn InvoiceStore,
    notifier: Arc<dyn InvoiceNotifier>,
    request: CreateInvoiceRequest,
) -> Result<Invoice, AppError> {
    let account_number = request.account_number.trim().to_string();
    if account_number.is_empty() || account_number.len() > MAX_ACCOUNT_NUMBER_LEN {
        return Err(AppError::InvalidRequest(format!(
            "Account number must be 1-{} characters",
            MAX_ACCOUNT_NUMBER_LEN
        )));
    }

    let invoice = NewInvoice {
        account_number,
        customer_name: validate_name(&request.customer_name)?,
        customer_email: validate_email(&request.customer_email)?,
        amount: validate_amount(request.amount)?,
        description: request.description.trim().to_string(),
        due_date: request.due_date,
    };

    let created = store.insert_invoice(invoice).await?;
    tracing::info!(
        invoice_id = created.id,
        account_number = %created.account_number,
        amount = %created.amount,
        "Invoice created"
    );

    dispatch_invoice_created(notifier, created.clone());

    Ok(created)
}

/// Apply an admin edit.
///
/// Paid invoices are rejected by the store. Amount and status edits are
/// also rejected while a payment is processing.
pub async fn update_invoice(
    store: &dyn InvoiceStore,
    id: i64,
    request: UpdateInvoiceRequest,
) -> Result<Invoice, AppError> {
    if let Some(status) = request.status {
        if !status.is_payable() {
            return Err(AppError::InvalidRequest(format!(
                "Status can only be set to unpaid or overdue, not {}",
                status
            )));
        }
    }

    let changes = InvoiceChanges {
        customer_name: request.customer_name.as_deref().map(validate_name).transpose()?,
        customer_email: request
            .customer_email
            .as_deref()
            .map(validate_email)
            .transpose()?,
        amount: request.amount.map(validate_amount).transpose()?,
        description: request.description.map(|d| d.trim().to_string()),
        due_date: request.due_date,
        status: request.status,
    };

    let updated = store.update_invoice(id, changes).await?;
    tracing::info!(invoice_id = id, status = %updated.status, "Invoice updated");

    Ok(updated)
}

/// Delete an invoice that has no payment in flight or recorded.
pub async fn delete_invoice(store: &dyn InvoiceStore, id: i64) -> Result<(), AppError> {
    store.delete_invoice(id).await?;
    tracing::info!(invoice_id = id, "Invoice deleted");
    Ok(())
}

pub async fn get_invoice(store: &dyn InvoiceStore, id: i64) -> Result<Invoice, AppError> {
    Ok(store.get_invoice(id).await?.ok_or(StoreError::NotFound)?)
}

/// Public lookup by account number.
pub async fn lookup_invoice(
    store: &dyn InvoiceStore,
    account_number: &str,
) -> Result<Invoice, AppError> {
    Ok(store
        .get_invoice_by_account(account_number.trim())
        .await?
        .ok_or(StoreError::NotFound)?)
}

/// Payments recorded against an invoice, newest first.
pub async fn list_payments(
    store: &dyn InvoiceStore,
    invoice_id: i64,
) -> Result<Vec<PaymentRecord>, AppError> {
    // 404 for unknown invoices rather than an empty list
    get_invoice(store, invoice_id).await?;
    Ok(store.list_payments(invoice_id).await?)
}

/// Mark unpaid invoices due before `today` as overdue.
pub async fn mark_overdue(store: &dyn InvoiceStore, today: NaiveDate) -> Result<u64, AppError> {
    let updated = store.mark_overdue(today).await?;
    if updated > 0 {
        tracing::info!(updated, %today, "Invoices marked overdue");
    }
    Ok(updated)
}

fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidRequest(
            "Customer name is required".to_string(),
        ));
    }
    Ok(name.to_string())
}

fn validate_email(email: &str) -> Result<String, AppError> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid || email.contains(char::is_whitespace) {
        return Err(AppError::InvalidRequest(
            "Customer email is invalid".to_string(),
        ));
    }
    Ok(email.to_string())
}

/// Amounts must be positive with at most two decimal places.
fn validate_amount(amount: Decimal) -> Result<Decimal, AppError> {
    if amount <= Decimal::ZERO || amount > max_amount() {
        return Err(AppError::InvalidRequest(
            "Amount must be positive and at most 9999999999.99".to_string(),
        ));
    }
    if amount.normalize().scale() > 2 {
        return Err(AppError::InvalidRequest(
            "Amount must have at most two decimal places".to_string(),
        ));
    }

    let mut amount = amount;
    amount.rescale(2);
    Ok(amount)
}
