//! PostgreSQL implementation of the invoice store.
//!
//! Every status guard lives in the SQL `WHERE` clause of the write itself, so
//! a concurrent admin edit and a reconciliation commit cannot interleave
//! between a check and a write. Payment idempotency relies on the UNIQUE
//! index on `payments.external_reference`.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{InvoiceStore, StoreError};
use crate::{
    db::DbPool,
    models::{
        invoice::{Invoice, InvoiceChanges, InvoiceStatus, NewInvoice},
        payment::{NewPaymentRecord, PaymentRecord},
    },
};

/// Invoice store backed by a `sqlx` PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgInvoiceStore {
    pool: DbPool,
}

impl PgInvoiceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded write matched no rows.
    async fn locked_or_missing(&self, id: i64) -> StoreError {
        match self.get_invoice(id).await {
            Ok(Some(invoice)) => StoreError::InvoiceLocked(invoice.status),
            Ok(None) => StoreError::NotFound,
            Err(e) => e,
        }
    }
}

/// True when the error is a UNIQUE constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[async_trait]
impl InvoiceStore for PgInvoiceStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_invoice(&self, id: i64) -> Result<Option<Invoice>, StoreError> {
        let invoice = sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(invoice)
    }

    async fn get_invoice_by_account(
        &self,
        account_number: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        let invoice =
            sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE account_number = $1")
                .bind(account_number)
                .fetch_optional(&self.pool)
                .await?;

        Ok(invoice)
    }

    async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
        let invoices =
            sqlx::query_as::<_, Invoice>("SELECT * FROM invoices ORDER BY created_at DESC, id DESC")
                .fetch_all(&self.pool)
                .await?;

        Ok(invoices)
    }

    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, StoreError> {
        sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                account_number,
                customer_name,
                customer_email,
                amount,
                description,
                due_date
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(invoice.account_number)
        .bind(invoice.customer_name)
        .bind(invoice.customer_email)
        .bind(invoice.amount)
        .bind(invoice.description)
        .bind(invoice.due_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateAccountNumber
            } else {
                StoreError::Database(e)
            }
        })
    }

    async fn update_invoice(
        &self,
        id: i64,
        changes: InvoiceChanges,
    ) -> Result<Invoice, StoreError> {
        // Paid rows never match; amount and status edits only match unpaid/overdue rows
        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET customer_name = COALESCE($2, customer_name),
                customer_email = COALESCE($3, customer_email),
                amount = COALESCE($4, amount),
                description = COALESCE($5, description),
                due_date = COALESCE($6, due_date),
                status = COALESCE($7, status),
                updated_at = NOW()
            WHERE id = $1
              AND status <> 'paid'
              AND (($4::numeric IS NULL AND $7::invoice_status IS NULL)
                   OR status IN ('unpaid', 'overdue'))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(changes.customer_name)
        .bind(changes.customer_email)
        .bind(changes.amount)
        .bind(changes.description)
        .bind(changes.due_date)
        .bind(changes.status)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(invoice) => Ok(invoice),
            None => Err(self.locked_or_missing(id).await),
        }
    }

    async fn set_status(&self, id: i64, status: InvoiceStatus) -> Result<Invoice, StoreError> {
        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $2,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'paid'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(invoice) = updated {
            return Ok(invoice);
        }

        match self.get_invoice(id).await? {
            Some(invoice) if status == InvoiceStatus::Paid => Ok(invoice),
            Some(invoice) => Err(StoreError::InvoiceLocked(invoice.status)),
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete_invoice(&self, id: i64) -> Result<(), StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM invoices
            WHERE id = $1
              AND status IN ('unpaid', 'overdue')
              AND NOT EXISTS (SELECT 1 FROM payments WHERE invoice_id = $1)
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted == 0 {
            return Err(self.locked_or_missing(id).await);
        }

        Ok(())
    }

    async fn mark_overdue(&self, today: NaiveDate) -> Result<u64, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'overdue',
                updated_at = NOW()
            WHERE status = 'unpaid' AND due_date < $1
            "#,
        )
        .bind(today)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated)
    }

    async fn list_payments(&self, invoice_id: i64) -> Result<Vec<PaymentRecord>, StoreError> {
        let payments = sqlx::query_as::<_, PaymentRecord>(
            "SELECT * FROM payments WHERE invoice_id = $1 ORDER BY created_at DESC",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    async fn find_payment_by_reference(
        &self,
        external_reference: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let payment = sqlx::query_as::<_, PaymentRecord>(
            "SELECT * FROM payments WHERE external_reference = $1",
        )
        .bind(external_reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn insert_payment(
        &self,
        payment: NewPaymentRecord,
    ) -> Result<PaymentRecord, StoreError> {
        // The UNIQUE index makes this the single arbiter between racing callers
        sqlx::query_as::<_, PaymentRecord>(
            r#"
            INSERT INTO payments (
                invoice_id,
                external_reference,
                amount,
                payment_method,
                status,
                processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(payment.invoice_id)
        .bind(&payment.external_reference)
        .bind(payment.amount)
        .bind(&payment.payment_method)
        .bind(&payment.status)
        .bind(payment.processed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateReference(payment.external_reference.clone())
            } else {
                StoreError::Database(e)
            }
        })
    }
}
