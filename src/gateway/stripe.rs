//! Stripe payment intent adapter.
//!
//! Talks to the Stripe REST API with `reqwest`:
//! - `POST /payment_intents` (form encoded) to create an intent
//! - `GET /payment_intents/{id}?expand[]=payment_method` to read it back
//!
//! The HTTP client carries the configured timeout, so a slow processor
//! surfaces as `GatewayError::Transport` instead of hanging a request.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{CreatedIntent, GatewayError, IntentMetadata, IntentStatus, PaymentGateway, PaymentIntent};

/// Stripe-backed implementation of [`PaymentGateway`].
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
}

/// Subset of the Stripe PaymentIntent object this service reads.
#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    status: String,
    amount: i64,
    currency: String,
    client_secret: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    payment_method_types: Vec<String>,
    /// Either an id string or, when expanded, the PaymentMethod object.
    payment_method: Option<serde_json::Value>,
}

impl StripeIntent {
    /// Kind of the payment method actually attached, falling back to the
    /// first allowed type.
    fn payment_method_kind(&self) -> String {
        self.payment_method
            .as_ref()
            .and_then(|pm| pm.get("type"))
            .and_then(|kind| kind.as_str())
            .map(str::to_string)
            .or_else(|| self.payment_method_types.first().cloned())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(
        api_base: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    /// Turn a non-2xx response into a gateway error.
    async fn upstream_error(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let message = match response.json::<StripeErrorBody>().await {
            Ok(body) => body
                .error
                .message
                .unwrap_or_else(|| "unknown error".to_string()),
            Err(_) => "unreadable error body".to_string(),
        };
        GatewayError::Upstream { status, message }
    }
}

/// Stripe ids are ASCII alphanumerics and underscores; anything else never
/// reaches the URL path.
fn is_valid_reference(reference: &str) -> bool {
    !reference.is_empty()
        && reference.len() <= 255
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<CreatedIntent, GatewayError> {
        let form = [
            ("amount", amount_minor.to_string()),
            ("currency", currency.to_lowercase()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("metadata[invoice_id]", metadata.invoice_id.to_string()),
            ("metadata[account_number]", metadata.account_number),
        ];

        let response = self
            .client
            .post(format!("{}/payment_intents", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let intent: StripeIntent = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        let client_token = intent
            .client_secret
            .ok_or_else(|| GatewayError::Malformed("missing client_secret".to_string()))?;

        tracing::info!(
            external_reference = %intent.id,
            invoice_id = metadata.invoice_id,
            amount_minor,
            "Stripe payment intent created"
        );

        Ok(CreatedIntent {
            client_token,
            external_reference: intent.id,
        })
    }

    async fn get_intent(&self, external_reference: &str) -> Result<PaymentIntent, GatewayError> {
        if !is_valid_reference(external_reference) {
            return Err(GatewayError::NotFound(external_reference.to_string()));
        }

        let response = self
            .client
            .get(format!(
                "{}/payment_intents/{}",
                self.api_base, external_reference
            ))
            .bearer_auth(&self.secret_key)
            .query(&[("expand[]", "payment_method")])
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(external_reference.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let intent: StripeIntent = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        let payment_method_kind = intent.payment_method_kind();
        let metadata_invoice_id = intent
            .metadata
            .get("invoice_id")
            .and_then(|raw| raw.parse::<i64>().ok());

        Ok(PaymentIntent {
            external_reference: intent.id,
            status: IntentStatus::parse(&intent.status),
            amount_minor: intent.amount,
            currency: intent.currency.to_lowercase(),
            metadata_invoice_id,
            payment_method_kind,
        })
    }
}
