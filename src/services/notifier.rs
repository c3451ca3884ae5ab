//! Invoice notifications.
//!
//! When an admin creates an invoice, the customer should hear about it. The
//! mail itself is sent by an external mailer; this module only hands the
//! event off, either to a webhook endpoint or to the log.
//!
//! # Delivery
//!
//! Notifications are fire-and-forget: `dispatch_invoice_created` spawns the
//! delivery and returns immediately, and a failed delivery is logged but never
//! fails invoice creation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::models::invoice::Invoice;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification endpoint responded {0}")]
    Rejected(u16),

    #[error("Failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outbound notification interface.
#[async_trait]
pub trait InvoiceNotifier: Send + Sync {
    async fn notify_invoice_created(&self, invoice: &Invoice) -> Result<(), NotifyError>;
}

/// Spawn delivery of an invoice-created notification.
pub fn dispatch_invoice_created(notifier: Arc<dyn InvoiceNotifier>, invoice: Invoice) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify_invoice_created(&invoice).await {
            tracing::warn!(
                invoice_id = invoice.id,
                error = %e,
                "Failed to send invoice notification"
            );
        }
    });
}

/// Notifier used when no endpoint is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl InvoiceNotifier for LogNotifier {
    async fn notify_invoice_created(&self, invoice: &Invoice) -> Result<(), NotifyError> {
        tracing::info!(
            invoice_id = invoice.id,
            account_number = %invoice.account_number,
            "Invoice created; no notification endpoint configured"
        );
        Ok(())
    }
}

/// Event body posted to the notification endpoint.
///
/// # Example
///
/// ```json
/// {
///   "event_type": "invoice.created",
///   "event_id": "550e8400-e29b-41d4-a716-446655440000",
///   "created_at": "2026-03-01T10:30:00Z",
///   "data": {
///     "invoice_id": 42,
///     "account_number": "ACC-1001",
///     "customer_name": "Jane Doe",
///     "customer_email": "jane@example.com",
///     "amount": "150.00",
///     "description": "Spring cleanup",
///     "due_date": "2026-04-01"
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct InvoiceCreatedEvent {
    pub event_type: &'static str,
    pub event_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub data: InvoiceCreatedData,
}

#[derive(Debug, Serialize)]
pub struct InvoiceCreatedData {
    pub invoice_id: i64,
    pub account_number: String,
    pub customer_name: String,
    pub customer_email: String,
    pub amount: Decimal,
    pub description: String,
    pub due_date: Option<NaiveDate>,
}

impl InvoiceCreatedEvent {
    pub fn new(invoice: &Invoice) -> Self {
        Self {
            event_type: "invoice.created",
            event_id: Uuid::new_v4(),
            created_at: Utc::now(),
            data: InvoiceCreatedData {
                invoice_id: invoice.id,
                account_number: invoice.account_number.clone(),
                customer_name: invoice.customer_name.clone(),
                customer_email: invoice.customer_email.clone(),
                amount: invoice.amount,
                description: invoice.description.clone(),
                due_date: invoice.due_date,
            },
        }
    }
}

/// Posts signed `invoice.created` events to an HTTP endpoint.
///
/// # Headers Sent
///
/// - `Content-Type: application/json`
/// - `X-Webhook-Signature: sha256=<hex>` (only when a secret is configured)
/// - `X-Webhook-Event-Id: <uuid>`
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, NotifyError> {
        // 5 seconds per delivery so a slow mailer never piles up tasks
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }
}

#[async_trait]
impl InvoiceNotifier for WebhookNotifier {
    async fn notify_invoice_created(&self, invoice: &Invoice) -> Result<(), NotifyError> {
        let event = InvoiceCreatedEvent::new(invoice);
        let body = serde_json::to_string(&event)?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event-Id", event.event_id.to_string());
        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Signature", generate_signature(secret, &body));
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }

        tracing::info!(
            invoice_id = invoice.id,
            event_id = %event.event_id,
            "Invoice notification delivered"
        );
        Ok(())
    }
}

/// Generate an HMAC-SHA256 signature for a notification body.
///
/// # Format
///
/// `sha256=<hex_encoded_hmac>`
pub fn generate_signature(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
