//! Reconciliation engine - verifies claimed payments and settles invoices exactly once.
//!
//! This service handles:
//! - Creating processor payment intents with amounts taken from the store
//! - Verifying a completed intent against the stored invoice
//! - Recording the payment and moving the invoice status
//! - Settling delayed (processing) payments once the processor confirms them
//! - Reopening a processing invoice when its delayed payment fails
//!
//! # Idempotency
//!
//! The engine keeps no state between calls. Every call re-reads the invoice
//! and the processor intent. Duplicate settlement is prevented by the
//! store's unique index on the payment reference: a second insert for the
//! same reference loses and is reported as `ConflictAlreadySettled`.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{
    gateway::{GatewayError, IntentMetadata, IntentStatus, PaymentGateway, PaymentIntent},
    models::{
        invoice::{Invoice, InvoiceStatus, from_minor_units},
        payment::{NewPaymentRecord, PaymentRecord},
    },
    store::{InvoiceStore, StoreError},
};

/// Why a reconciliation attempt did not settle.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Invoice {0} not found")]
    InvoiceNotFound(i64),

    #[error("No payment recorded for reference {0}")]
    PaymentNotFound(String),

    /// The intent was created for a different invoice (or carries no invoice).
    #[error("Payment intent belongs to invoice {intent_invoice_id:?}, not {invoice_id}")]
    IntegrityViolation {
        invoice_id: i64,
        intent_invoice_id: Option<i64>,
    },

    #[error("Payment amount {actual_minor} does not match invoice amount {expected}")]
    AmountMismatch { expected: Decimal, actual_minor: i64 },

    #[error("Payment currency {actual} does not match {expected}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Payment is not complete: {0}")]
    PaymentIncomplete(String),

    #[error("Invoice is {0} and cannot take a new payment")]
    InvoiceNotPayable(InvoiceStatus),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// A concurrent call recorded this reference first.
    #[error("Payment {0} was already settled by a concurrent request")]
    ConflictAlreadySettled(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Whether the caller may safely retry the same call.
    ///
    /// Gateway failures mutate nothing; a conflict means the desired end
    /// state is already reached.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Gateway(_) | ReconcileError::ConflictAlreadySettled(_)
        )
    }

    /// Failures that indicate tampering or a client bug.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            ReconcileError::IntegrityViolation { .. }
                | ReconcileError::AmountMismatch { .. }
                | ReconcileError::CurrencyMismatch { .. }
        )
    }
}

/// Successful result of `reconcile` or `settle`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The invoice was already paid; nothing was verified or written.
    AlreadyPaid { invoice_id: i64 },

    /// A payment is recorded for the reference and the invoice reflects it.
    Settled {
        invoice_id: i64,
        amount: Decimal,
        payment_method: String,
        payment_status: String,
        invoice_status: InvoiceStatus,
        /// True when the payment record existed before this call
        replayed: bool,
    },

    /// The processor is still settling the payment.
    Pending { invoice_id: i64 },

    /// The delayed payment failed or was canceled; the invoice can be paid again.
    Reopened {
        invoice_id: i64,
        payment_status: String,
        invoice_status: InvoiceStatus,
    },
}

/// What the browser needs to confirm a payment with the processor.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentTicket {
    pub invoice_id: i64,
    pub client_token: String,
    pub external_reference: String,
    pub amount_minor: i64,
    pub currency: String,
}

/// Invoice status implied by a processor payment status.
fn target_status(payment_status: &str) -> InvoiceStatus {
    if payment_status == IntentStatus::Succeeded.as_str() {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Processing
    }
}

/// Only succeeded and processing intents count as payments.
fn require_complete(intent: &PaymentIntent) -> Result<(), ReconcileError> {
    match intent.status {
        IntentStatus::Succeeded | IntentStatus::Processing => Ok(()),
        ref other => Err(ReconcileError::PaymentIncomplete(other.as_str().to_string())),
    }
}

/// Stateless engine over an invoice store and a payment gateway.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn InvoiceStore>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into().to_lowercase(),
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Create a processor payment intent for an invoice.
    ///
    /// The amount always comes from the store. Paid and processing invoices
    /// are rejected so a second payment cannot be started while one is
    /// settling.
    pub async fn create_payment_intent(
        &self,
        invoice_id: i64,
    ) -> Result<PaymentIntentTicket, ReconcileError> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or(ReconcileError::InvoiceNotFound(invoice_id))?;

        if !invoice.status.is_payable() {
            return Err(ReconcileError::InvoiceNotPayable(invoice.status));
        }

        let amount_minor = invoice
            .amount_minor_units()
            .filter(|minor| *minor > 0)
            .ok_or(ReconcileError::AmountMismatch {
                expected: invoice.amount,
                actual_minor: 0,
            })?;

        let metadata = IntentMetadata {
            invoice_id: invoice.id,
            account_number: invoice.account_number.clone(),
        };
        let created = self
            .gateway
            .create_intent(amount_minor, &self.currency, metadata)
            .await?;

        tracing::info!(
            invoice_id,
            external_reference = %created.external_reference,
            amount_minor,
            "Payment intent created"
        );

        Ok(PaymentIntentTicket {
            invoice_id,
            client_token: created.client_token,
            external_reference: created.external_reference,
            amount_minor,
            currency: self.currency.clone(),
        })
    }

    /// Verify that `external_reference` paid `invoice_id` and settle it.
    ///
    /// # Process
    ///
    /// 1. Load the invoice (missing → `InvoiceNotFound`)
    /// 2. Paid invoice → `AlreadyPaid` without touching the gateway
    /// 3. Load the intent from the gateway
    /// 4. Check owning invoice, amount, currency and status
    /// 5. Existing payment record for the reference → re-apply its status
    ///    transition and report it
    /// 6. Insert the payment record (losing a race → `ConflictAlreadySettled`)
    /// 7. Move the invoice to `paid` or `processing`
    ///
    /// Nothing is written unless every check in step 4 passes.
    pub async fn reconcile(
        &self,
        invoice_id: i64,
        external_reference: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or(ReconcileError::InvoiceNotFound(invoice_id))?;

        if invoice.status == InvoiceStatus::Paid {
            tracing::info!(invoice_id, external_reference, "Invoice already paid");
            return Ok(ReconcileOutcome::AlreadyPaid { invoice_id });
        }

        let intent = self.verify_intent(&invoice, external_reference).await?;
        require_complete(&intent)?;

        if let Some(existing) = self
            .store
            .find_payment_by_reference(external_reference)
            .await?
        {
            return self.replay(&invoice, &intent, existing).await;
        }

        let payment = NewPaymentRecord {
            invoice_id,
            external_reference: external_reference.to_string(),
            amount: from_minor_units(intent.amount_minor),
            payment_method: intent.payment_method_kind.clone(),
            status: intent.status.as_str().to_string(),
            processed_at: (intent.status == IntentStatus::Succeeded).then(Utc::now),
        };

        let record = match self.store.insert_payment(payment).await {
            Ok(record) => record,
            Err(StoreError::DuplicateReference(reference)) => {
                tracing::info!(
                    invoice_id,
                    external_reference = %reference,
                    "Concurrent reconciliation recorded this payment first"
                );
                return Err(ReconcileError::ConflictAlreadySettled(reference));
            }
            Err(e) => return Err(e.into()),
        };

        let target = target_status(&record.status);
        let updated = self
            .store
            .set_status(invoice_id, target)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    invoice_id,
                    external_reference,
                    error = %e,
                    "Payment recorded but invoice status update failed; retry will repair it"
                );
            })?;

        tracing::info!(
            invoice_id,
            external_reference,
            amount = %record.amount,
            payment_method = %record.payment_method,
            invoice_status = %updated.status,
            "Payment reconciled"
        );

        Ok(ReconcileOutcome::Settled {
            invoice_id,
            amount: record.amount,
            payment_method: record.payment_method,
            payment_status: record.status,
            invoice_status: updated.status,
            replayed: false,
        })
    }

    /// Complete a delayed payment once the processor reports it.
    ///
    /// Looks the payment up by reference and re-verifies the intent:
    ///
    /// - `processing` → `Pending`
    /// - `succeeded` → invoice moves to `paid`
    /// - `canceled` / `requires_payment_method` → a processing invoice moves
    ///   back to `unpaid` (`Reopened`) when this reference is its latest
    ///   payment, so the customer can start a new one
    /// - anything else → `PaymentIncomplete`
    ///
    /// The payment record itself is left as recorded.
    pub async fn settle(
        &self,
        external_reference: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let record = self
            .store
            .find_payment_by_reference(external_reference)
            .await?
            .ok_or_else(|| ReconcileError::PaymentNotFound(external_reference.to_string()))?;

        let invoice = self
            .store
            .get_invoice(record.invoice_id)
            .await?
            .ok_or(ReconcileError::InvoiceNotFound(record.invoice_id))?;

        if invoice.status == InvoiceStatus::Paid {
            return Ok(ReconcileOutcome::AlreadyPaid {
                invoice_id: invoice.id,
            });
        }

        let intent = self.verify_intent(&invoice, external_reference).await?;

        if matches!(
            intent.status,
            IntentStatus::Canceled | IntentStatus::RequiresPaymentMethod
        ) {
            return self.reopen(&invoice, &record, &intent).await;
        }
        require_complete(&intent)?;

        if intent.status == IntentStatus::Processing {
            // Also repairs an invoice left unpaid by a crash after the insert
            self.store
                .set_status(invoice.id, InvoiceStatus::Processing)
                .await?;
            return Ok(ReconcileOutcome::Pending {
                invoice_id: invoice.id,
            });
        }

        let updated = self.store.set_status(invoice.id, InvoiceStatus::Paid).await?;

        tracing::info!(
            invoice_id = invoice.id,
            external_reference,
            "Delayed payment settled"
        );

        Ok(ReconcileOutcome::Settled {
            invoice_id: invoice.id,
            amount: record.amount,
            payment_method: record.payment_method,
            payment_status: intent.status.as_str().to_string(),
            invoice_status: updated.status,
            replayed: false,
        })
    }

    /// Apply a processor notification for `external_reference`.
    ///
    /// A reference that already has a payment record goes through `settle`;
    /// otherwise the invoice named by the intent metadata is reconciled.
    /// Returns `None` when there is nothing to act on.
    pub async fn handle_notification(
        &self,
        external_reference: &str,
        invoice_id: Option<i64>,
    ) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        if self
            .store
            .find_payment_by_reference(external_reference)
            .await?
            .is_some()
        {
            return self.settle(external_reference).await.map(Some);
        }

        match invoice_id {
            Some(invoice_id) => self.reconcile(invoice_id, external_reference).await.map(Some),
            None => {
                tracing::info!(
                    external_reference,
                    "Notification carries no invoice id; ignoring"
                );
                Ok(None)
            }
        }
    }

    /// Move a processing invoice back to `unpaid` after its payment failed.
    ///
    /// Only the latest payment recorded for the invoice may do this, so a late
    /// failure for an earlier attempt cannot undo a newer one. The amount
    /// stays as it was.
    async fn reopen(
        &self,
        invoice: &Invoice,
        record: &PaymentRecord,
        intent: &PaymentIntent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let payment_status = intent.status.as_str().to_string();

        let superseded = self
            .store
            .list_payments(invoice.id)
            .await?
            .iter()
            .any(|p| {
                p.external_reference != record.external_reference
                    && p.created_at >= record.created_at
            });
        if invoice.status != InvoiceStatus::Processing || superseded {
            return Err(ReconcileError::PaymentIncomplete(payment_status));
        }

        let updated = self
            .store
            .set_status(invoice.id, InvoiceStatus::Unpaid)
            .await?;

        tracing::warn!(
            invoice_id = invoice.id,
            external_reference = %record.external_reference,
            payment_status = %payment_status,
            "Delayed payment failed; invoice reopened"
        );

        Ok(ReconcileOutcome::Reopened {
            invoice_id: invoice.id,
            payment_status,
            invoice_status: updated.status,
        })
    }

    /// Fetch the intent and check it against the invoice.
    ///
    /// Checks ownership, amount and currency. Completion is checked by the
    /// caller with `require_complete`.
    async fn verify_intent(
        &self,
        invoice: &Invoice,
        external_reference: &str,
    ) -> Result<PaymentIntent, ReconcileError> {
        let intent = self
            .gateway
            .get_intent(external_reference)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    invoice_id = invoice.id,
                    external_reference,
                    error = %e,
                    "Payment intent lookup failed"
                );
            })?;

        let check = self.check_intent(invoice, &intent);
        if let Err(ref e) = check {
            if e.is_security_event() {
                tracing::warn!(
                    target: "security",
                    invoice_id = invoice.id,
                    external_reference,
                    error = %e,
                    "Rejected payment intent that does not match the invoice"
                );
            }
        }
        check.map(|_| intent)
    }

    fn check_intent(&self, invoice: &Invoice, intent: &PaymentIntent) -> Result<(), ReconcileError> {
        if intent.metadata_invoice_id != Some(invoice.id) {
            return Err(ReconcileError::IntegrityViolation {
                invoice_id: invoice.id,
                intent_invoice_id: intent.metadata_invoice_id,
            });
        }

        if invoice.amount_minor_units() != Some(intent.amount_minor) {
            return Err(ReconcileError::AmountMismatch {
                expected: invoice.amount,
                actual_minor: intent.amount_minor,
            });
        }

        if !intent.currency.eq_ignore_ascii_case(&self.currency) {
            return Err(ReconcileError::CurrencyMismatch {
                expected: self.currency.clone(),
                actual: intent.currency.clone(),
            });
        }

        Ok(())
    }

    /// Report an already-recorded payment, re-applying its status transition.
    ///
    /// The target comes from the recorded status, except that a recorded
    /// `processing` payment whose intent has since succeeded moves the
    /// invoice to `paid`. The record is not rewritten.
    async fn replay(
        &self,
        invoice: &Invoice,
        intent: &PaymentIntent,
        existing: PaymentRecord,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if existing.invoice_id != invoice.id {
            return Err(ReconcileError::IntegrityViolation {
                invoice_id: invoice.id,
                intent_invoice_id: Some(existing.invoice_id),
            });
        }

        let target = if intent.status == IntentStatus::Succeeded {
            InvoiceStatus::Paid
        } else {
            target_status(&existing.status)
        };
        let invoice_status = if invoice.status == target {
            invoice.status
        } else {
            self.store.set_status(invoice.id, target).await?.status
        };

        tracing::info!(
            invoice_id = invoice.id,
            external_reference = %existing.external_reference,
            invoice_status = %invoice_status,
            "Payment already recorded; replaying result"
        );

        Ok(ReconcileOutcome::Settled {
            invoice_id: invoice.id,
            amount: existing.amount,
            payment_method: existing.payment_method,
            payment_status: existing.status,
            invoice_status,
            replayed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::InMemoryGateway,
        models::invoice::{InvoiceChanges, NewInvoice},
        store::InMemoryInvoiceStore,
    };
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    /// Store wrapper that can fail status updates and hold lookups at a barrier.
    struct FaultyStore {
        inner: InMemoryInvoiceStore,
        failing_status_updates: AtomicUsize,
        lookup_barrier: Option<Barrier>,
    }

    impl FaultyStore {
        fn new(inner: InMemoryInvoiceStore) -> Self {
            Self {
                inner,
                failing_status_updates: AtomicUsize::new(0),
                lookup_barrier: None,
            }
        }
    }

    #[async_trait]
    impl InvoiceStore for FaultyStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
        async fn get_invoice(&self, id: i64) -> Result<Option<Invoice>, StoreError> {
            self.inner.get_invoice(id).await
        }
        async fn get_invoice_by_account(
            &self,
            account_number: &str,
        ) -> Result<Option<Invoice>, StoreError> {
            self.inner.get_invoice_by_account(account_number).await
        }
        async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
            self.inner.list_invoices().await
        }
        async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, StoreError> {
            self.inner.insert_invoice(invoice).await
        }
        async fn update_invoice(
            &self,
            id: i64,
            changes: InvoiceChanges,
        ) -> Result<Invoice, StoreError> {
            self.inner.update_invoice(id, changes).await
        }
        async fn set_status(
            &self,
            id: i64,
            status: InvoiceStatus,
        ) -> Result<Invoice, StoreError> {
            let remaining = self.failing_status_updates.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_status_updates
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.set_status(id, status).await
        }
        async fn delete_invoice(&self, id: i64) -> Result<(), StoreError> {
            self.inner.delete_invoice(id).await
        }
        async fn mark_overdue(&self, today: NaiveDate) -> Result<u64, StoreError> {
            self.inner.mark_overdue(today).await
        }
        async fn list_payments(&self, invoice_id: i64) -> Result<Vec<PaymentRecord>, StoreError> {
            self.inner.list_payments(invoice_id).await
        }
        async fn find_payment_by_reference(
            &self,
            external_reference: &str,
        ) -> Result<Option<PaymentRecord>, StoreError> {
            if let Some(barrier) = &self.lookup_barrier {
                barrier.wait().await;
            }
            self.inner.find_payment_by_reference(external_reference).await
        }
        async fn insert_payment(
            &self,
            payment: NewPaymentRecord,
        ) -> Result<PaymentRecord, StoreError> {
            self.inner.insert_payment(payment).await
        }
    }

    async fn seed_invoice(store: &InMemoryInvoiceStore, amount: Decimal) -> Invoice {
        store
            .insert_invoice(NewInvoice {
                account_number: format!("ACC-{}", amount),
                customer_name: "Jane Doe".to_string(),
                customer_email: "jane@example.com".to_string(),
                amount,
                description: "Monthly service".to_string(),
                due_date: None,
            })
            .await
            .unwrap()
    }

    fn intent(reference: &str, invoice_id: i64, amount_minor: i64, status: &str) -> PaymentIntent {
        PaymentIntent {
            external_reference: reference.to_string(),
            status: IntentStatus::parse(status),
            amount_minor,
            currency: "usd".to_string(),
            metadata_invoice_id: Some(invoice_id),
            payment_method_kind: "card".to_string(),
        }
    }

    fn engine(store: Arc<dyn InvoiceStore>, gateway: &InMemoryGateway) -> Reconciler {
        Reconciler::new(store, Arc::new(gateway.clone()), "usd")
    }

    async fn status_of(store: &InMemoryInvoiceStore, id: i64) -> InvoiceStatus {
        store.get_invoice(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_completed_payment_settles_and_marks_paid() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;
        gateway.put(intent("pi_1", invoice.id, 2500, "succeeded")).await;

        let outcome = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice.id, "pi_1")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Settled {
                invoice_id: invoice.id,
                amount: dec!(25.00),
                payment_method: "card".to_string(),
                payment_status: "succeeded".to_string(),
                invoice_status: InvoiceStatus::Paid,
                replayed: false,
            }
        );
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Paid);

        let payments = store.list_payments(invoice.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert!(payments[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn test_repeat_reconcile_is_idempotent() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;
        gateway.put(intent("pi_1", invoice.id, 2500, "succeeded")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);

        reconciler.reconcile(invoice.id, "pi_1").await.unwrap();
        let second = reconciler.reconcile(invoice.id, "pi_1").await.unwrap();

        assert_eq!(
            second,
            ReconcileOutcome::AlreadyPaid {
                invoice_id: invoice.id
            }
        );
        assert_eq!(store.list_payments(invoice.id).await.unwrap().len(), 1);
        let stored = store.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.amount, dec!(25.00));
    }

    #[tokio::test]
    async fn test_paid_invoice_short_circuits_without_gateway_lookup() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;
        store.set_status(invoice.id, InvoiceStatus::Paid).await.unwrap();

        let outcome = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice.id, "pi_unknown")
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::AlreadyPaid { .. }));
        assert_eq!(gateway.lookups(), 0);
    }

    #[tokio::test]
    async fn test_processing_payment_replays_without_duplicate() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(80.00)).await;
        let mut bank = intent("pi_ach", invoice.id, 8000, "processing");
        bank.payment_method_kind = "us_bank_account".to_string();
        gateway.put(bank).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);

        let first = reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();
        let second = reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();

        assert!(matches!(
            first,
            ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Processing,
                replayed: false,
                ..
            }
        ));
        assert!(matches!(
            second,
            ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Processing,
                replayed: true,
                ref payment_method,
                ..
            } if payment_method == "us_bank_account"
        ));
        assert_eq!(store.list_payments(invoice.id).await.unwrap().len(), 1);
        let payment = &store.list_payments(invoice.id).await.unwrap()[0];
        assert!(payment.processed_at.is_none());
    }

    #[tokio::test]
    async fn test_intent_for_other_invoice_is_rejected() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice_a = seed_invoice(&store, dec!(25.00)).await;
        let invoice_b = seed_invoice(&store, dec!(26.00)).await;
        // Intent created for A, with B's amount so only the owner check fails
        gateway.put(intent("pi_a", invoice_a.id, 2600, "succeeded")).await;

        let err = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice_b.id, "pi_a")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::IntegrityViolation { .. }));
        assert!(err.is_security_event());
        assert_eq!(status_of(&store, invoice_b.id).await, InvoiceStatus::Unpaid);
        assert!(store.list_payments(invoice_b.id).await.unwrap().is_empty());
        assert!(store.find_payment_by_reference("pi_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_metadata_is_integrity_violation() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;
        let mut orphan = intent("pi_orphan", invoice.id, 2500, "succeeded");
        orphan.metadata_invoice_id = None;
        gateway.put(orphan).await;

        let err = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice.id, "pi_orphan")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::IntegrityViolation {
                intent_invoice_id: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_short_amount_is_rejected() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(150.00)).await;
        gateway.put(intent("pi_short", invoice.id, 14999, "succeeded")).await;

        let err = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice.id, "pi_short")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::AmountMismatch {
                actual_minor: 14999,
                ..
            }
        ));
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Unpaid);
        assert!(store.list_payments(invoice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_currency_is_rejected() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;
        let mut euro = intent("pi_eur", invoice.id, 2500, "succeeded");
        euro.currency = "eur".to_string();
        gateway.put(euro).await;

        let err = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice.id, "pi_eur")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::CurrencyMismatch { .. }));
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_incomplete_payment_leaves_invoice_unpaid() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;
        gateway
            .put(intent("pi_rpm", invoice.id, 2500, "requires_payment_method"))
            .await;

        let err = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice.id, "pi_rpm")
            .await
            .unwrap_err();

        assert!(
            matches!(err, ReconcileError::PaymentIncomplete(ref s) if s == "requires_payment_method")
        );
        assert!(!err.is_retryable());
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Unpaid);
    }

    #[tokio::test]
    async fn test_gateway_failure_mutates_nothing() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;
        gateway.put(intent("pi_1", invoice.id, 2500, "succeeded")).await;
        gateway.set_offline(true);
        let reconciler = engine(Arc::new(store.clone()), &gateway);

        let err = reconciler.reconcile(invoice.id, "pi_1").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Gateway(GatewayError::Transport(_))));
        assert!(err.is_retryable());
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Unpaid);

        gateway.set_offline(false);
        let outcome = reconciler.reconcile(invoice.id, "pi_1").await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Settled { .. }));
    }

    #[tokio::test]
    async fn test_unknown_intent_is_gateway_error() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(25.00)).await;

        let err = engine(Arc::new(store.clone()), &gateway)
            .reconcile(invoice.id, "pi_nope")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Gateway(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_invoice_is_not_found() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();

        let err = engine(Arc::new(store), &gateway)
            .reconcile(404, "pi_1")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::InvoiceNotFound(404)));
    }

    #[tokio::test]
    async fn test_retry_after_failed_status_update_repairs_invoice() {
        let memory = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&memory, dec!(25.00)).await;
        gateway.put(intent("pi_1", invoice.id, 2500, "succeeded")).await;
        let faulty = FaultyStore::new(memory.clone());
        faulty.failing_status_updates.store(1, Ordering::SeqCst);
        let reconciler = engine(Arc::new(faulty), &gateway);

        let err = reconciler.reconcile(invoice.id, "pi_1").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(_)));
        assert_eq!(status_of(&memory, invoice.id).await, InvoiceStatus::Unpaid);
        assert_eq!(memory.list_payments(invoice.id).await.unwrap().len(), 1);

        let outcome = reconciler.reconcile(invoice.id, "pi_1").await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Paid,
                replayed: true,
                ..
            }
        ));
        assert_eq!(status_of(&memory, invoice.id).await, InvoiceStatus::Paid);
        assert_eq!(memory.list_payments(invoice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_racing_reconciles_settle_once() {
        let memory = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&memory, dec!(25.00)).await;
        gateway.put(intent("pi_1", invoice.id, 2500, "succeeded")).await;

        // Both calls pass the existing-payment lookup before either inserts
        let mut faulty = FaultyStore::new(memory.clone());
        faulty.lookup_barrier = Some(Barrier::new(2));
        let reconciler = engine(Arc::new(faulty), &gateway);

        let (a, b) = tokio::join!(
            reconciler.reconcile(invoice.id, "pi_1"),
            reconciler.reconcile(invoice.id, "pi_1"),
        );

        let results = [a, b];
        let settled = results
            .iter()
            .filter(|r| matches!(r, Ok(ReconcileOutcome::Settled { replayed: false, .. })))
            .count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(ReconcileError::ConflictAlreadySettled(_))))
            .count();

        assert_eq!(settled, 1);
        assert_eq!(conflicts, 1);
        assert_eq!(memory.list_payments(invoice.id).await.unwrap().len(), 1);
        assert_eq!(status_of(&memory, invoice.id).await, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn test_create_intent_uses_stored_amount() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(150.00)).await;

        let ticket = engine(Arc::new(store.clone()), &gateway)
            .create_payment_intent(invoice.id)
            .await
            .unwrap();

        assert_eq!(ticket.amount_minor, 15000);
        assert_eq!(ticket.currency, "usd");
        let created = gateway.get_intent(&ticket.external_reference).await.unwrap();
        assert_eq!(created.amount_minor, 15000);
        assert_eq!(created.metadata_invoice_id, Some(invoice.id));
    }

    #[tokio::test]
    async fn test_create_intent_rejects_settling_invoice() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(150.00)).await;
        store
            .set_status(invoice.id, InvoiceStatus::Processing)
            .await
            .unwrap();

        let err = engine(Arc::new(store.clone()), &gateway)
            .create_payment_intent(invoice.id)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::InvoiceNotPayable(InvoiceStatus::Processing)
        ));
    }

    #[tokio::test]
    async fn test_settle_moves_processing_invoice_to_paid() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(80.00)).await;
        gateway.put(intent("pi_ach", invoice.id, 8000, "processing")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);
        reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();

        let pending = reconciler.settle("pi_ach").await.unwrap();
        assert_eq!(
            pending,
            ReconcileOutcome::Pending {
                invoice_id: invoice.id
            }
        );

        gateway.set_status("pi_ach", IntentStatus::Succeeded).await;
        let settled = reconciler.settle("pi_ach").await.unwrap();
        assert!(matches!(
            settled,
            ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Paid,
                ..
            }
        ));
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Paid);

        // Original snapshot is untouched
        let payment = store.find_payment_by_reference("pi_ach").await.unwrap().unwrap();
        assert_eq!(payment.status, "processing");

        let again = reconciler.settle("pi_ach").await.unwrap();
        assert!(matches!(again, ReconcileOutcome::AlreadyPaid { .. }));
    }

    #[tokio::test]
    async fn test_settle_failed_bank_debit_reopens_invoice() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(80.00)).await;
        gateway.put(intent("pi_ach", invoice.id, 8000, "processing")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);
        reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();

        gateway
            .set_status("pi_ach", IntentStatus::RequiresPaymentMethod)
            .await;
        let outcome = reconciler.settle("pi_ach").await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Reopened {
                invoice_id: invoice.id,
                payment_status: "requires_payment_method".to_string(),
                invoice_status: InvoiceStatus::Unpaid,
            }
        );
        let stored = store.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Unpaid);
        assert_eq!(stored.amount, dec!(80.00));

        // Snapshot kept, and the customer can pay again
        let payment = store.find_payment_by_reference("pi_ach").await.unwrap().unwrap();
        assert_eq!(payment.status, "processing");
        let ticket = reconciler.create_payment_intent(invoice.id).await.unwrap();
        assert_eq!(ticket.amount_minor, 8000);
    }

    #[tokio::test]
    async fn test_canceled_intent_reopens_then_new_payment_settles() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(80.00)).await;
        gateway.put(intent("pi_ach", invoice.id, 8000, "processing")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);
        reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();

        gateway.set_status("pi_ach", IntentStatus::Canceled).await;
        let reopened = reconciler.settle("pi_ach").await.unwrap();
        assert!(matches!(
            reopened,
            ReconcileOutcome::Reopened { ref payment_status, .. } if payment_status == "canceled"
        ));

        // Reconciling the canceled reference again changes nothing
        let err = reconciler.reconcile(invoice.id, "pi_ach").await.unwrap_err();
        assert!(matches!(err, ReconcileError::PaymentIncomplete(ref s) if s == "canceled"));
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Unpaid);

        gateway.put(intent("pi_card", invoice.id, 8000, "succeeded")).await;
        let settled = reconciler.reconcile(invoice.id, "pi_card").await.unwrap();
        assert!(matches!(
            settled,
            ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Paid,
                replayed: false,
                ..
            }
        ));
        assert_eq!(store.list_payments(invoice.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_late_failure_of_earlier_payment_does_not_reopen() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(80.00)).await;
        gateway.put(intent("pi_old", invoice.id, 8000, "processing")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);
        reconciler.reconcile(invoice.id, "pi_old").await.unwrap();

        gateway.set_status("pi_old", IntentStatus::Canceled).await;
        reconciler.settle("pi_old").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        gateway.put(intent("pi_new", invoice.id, 8000, "processing")).await;
        reconciler.reconcile(invoice.id, "pi_new").await.unwrap();
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Processing);

        // A redelivered cancel for the first attempt must not undo the second
        let err = reconciler.settle("pi_old").await.unwrap_err();
        assert!(matches!(err, ReconcileError::PaymentIncomplete(ref s) if s == "canceled"));
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Processing);
    }

    #[tokio::test]
    async fn test_settle_other_incomplete_status_keeps_processing() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(80.00)).await;
        gateway.put(intent("pi_ach", invoice.id, 8000, "processing")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);
        reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();

        gateway.set_status("pi_ach", IntentStatus::RequiresAction).await;
        let err = reconciler.settle("pi_ach").await.unwrap_err();

        assert!(matches!(err, ReconcileError::PaymentIncomplete(ref s) if s == "requires_action"));
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Processing);
    }

    #[tokio::test]
    async fn test_reconcile_retry_after_delayed_success_marks_paid() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(80.00)).await;
        gateway.put(intent("pi_ach", invoice.id, 8000, "processing")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);
        reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();

        gateway.set_status("pi_ach", IntentStatus::Succeeded).await;
        let outcome = reconciler.reconcile(invoice.id, "pi_ach").await.unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Paid,
                replayed: true,
                ..
            }
        ));
        assert_eq!(status_of(&store, invoice.id).await, InvoiceStatus::Paid);

        let payments = store.list_payments(invoice.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, "processing");
    }

    #[tokio::test]
    async fn test_settle_unknown_reference() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();

        let err = engine(Arc::new(store), &gateway)
            .settle("pi_never")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::PaymentNotFound(ref r) if r == "pi_never"));
    }

    #[tokio::test]
    async fn test_notification_reconciles_then_settles() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let invoice = seed_invoice(&store, dec!(40.00)).await;
        gateway.put(intent("pi_wh", invoice.id, 4000, "processing")).await;
        let reconciler = engine(Arc::new(store.clone()), &gateway);

        let first = reconciler
            .handle_notification("pi_wh", Some(invoice.id))
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Processing,
                ..
            })
        ));

        gateway.set_status("pi_wh", IntentStatus::Succeeded).await;
        // Metadata is not needed once the payment is recorded
        let second = reconciler.handle_notification("pi_wh", None).await.unwrap();
        assert!(matches!(
            second,
            Some(ReconcileOutcome::Settled {
                invoice_status: InvoiceStatus::Paid,
                ..
            })
        ));
        assert_eq!(store.list_payments(invoice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_without_invoice_is_ignored() {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();

        let outcome = engine(Arc::new(store), &gateway)
            .handle_notification("pi_orphan", None)
            .await
            .unwrap();

        assert_eq!(outcome, None);
        assert_eq!(gateway.lookups(), 0);
    }
}
