//! Payment intent gateway: the seam between this service and a payment processor.
//!
//! The gateway has no local state. It only creates and reads processor
//! payment intents, and every value the reconciliation engine trusts
//! (amount, currency, owning invoice, status) comes from `get_intent`, never
//! from the client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod stripe;
pub mod stripe_webhook;

pub use memory::InMemoryGateway;
pub use stripe::StripeGateway;

/// Processor-side status of a payment intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentStatus {
    /// Funds captured.
    Succeeded,
    /// Accepted but still settling (bank debits and similar delayed methods).
    Processing,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    RequiresCapture,
    Canceled,
    Other(String),
}

impl IntentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "succeeded" => IntentStatus::Succeeded,
            "processing" => IntentStatus::Processing,
            "requires_payment_method" => IntentStatus::RequiresPaymentMethod,
            "requires_confirmation" => IntentStatus::RequiresConfirmation,
            "requires_action" => IntentStatus::RequiresAction,
            "requires_capture" => IntentStatus::RequiresCapture,
            "canceled" => IntentStatus::Canceled,
            other => IntentStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Processing => "processing",
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to an intent at creation, read back during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMetadata {
    pub invoice_id: i64,
    pub account_number: String,
}

/// Result of creating an intent.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedIntent {
    /// Secret handed to the browser to confirm the payment with the processor
    pub client_token: String,
    /// Processor intent id, later passed back to reconcile
    pub external_reference: String,
}

/// Processor view of a payment intent.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntent {
    pub external_reference: String,
    pub status: IntentStatus,
    pub amount_minor: i64,
    /// Lowercase ISO 4217 code
    pub currency: String,
    /// Invoice id recorded in the intent metadata, if present and numeric
    pub metadata_invoice_id: Option<i64>,
    pub payment_method_kind: String,
}

/// Errors surfaced by gateway implementations.
///
/// None of these are retried by the engine; callers may retry since the
/// gateway never mutates local state.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("payment intent {0} not found")]
    NotFound(String),

    #[error("processor responded {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Network failure or timeout talking to the processor
    #[error("processor request failed: {0}")]
    Transport(String),

    #[error("malformed processor response: {0}")]
    Malformed(String),
}

/// Capability interface over a payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<CreatedIntent, GatewayError>;

    async fn get_intent(&self, external_reference: &str) -> Result<PaymentIntent, GatewayError>;
}
