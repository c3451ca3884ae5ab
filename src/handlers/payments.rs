//! HTTP handlers for the public payment flow.
//!
//! The browser asks for a payment intent, confirms it with the processor,
//! then calls `reconcile` with the intent reference. The processor can also
//! report outcomes directly through the signed webhook.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    AppState,
    error::AppError,
    gateway::stripe_webhook::{self, StripeEvent},
    services::reconciliation::{ReconcileError, ReconcileOutcome},
};

#[derive(Debug, Deserialize)]
pub struct CreateIntentRequest {
    pub invoice_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub invoice_id: i64,
    pub external_reference: String,
}

/// Reconciliation result as seen by the payment page.
///
/// ```json
/// {
///   "settled": true,
///   "already_paid": false,
///   "outcome": "settled",
///   "invoice_id": 42,
///   "amount": "25.00",
///   "payment_method": "card",
///   "payment_status": "succeeded",
///   "invoice_status": "paid",
///   "replayed": false
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub settled: bool,
    pub already_paid: bool,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

impl From<ReconcileOutcome> for ReconcileResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            settled: !matches!(
                outcome,
                ReconcileOutcome::Pending { .. } | ReconcileOutcome::Reopened { .. }
            ),
            already_paid: matches!(outcome, ReconcileOutcome::AlreadyPaid { .. }),
            outcome,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
}

/// Create a processor payment intent for an invoice.
///
/// # Request Body
///
/// ```json
/// { "invoice_id": 42 }
/// ```
///
/// # Response
///
/// Returns 201 Created. The amount always comes from the stored invoice.
///
/// ```json
/// {
///   "invoice_id": 42,
///   "client_token": "pi_3Mt..._secret_...",
///   "external_reference": "pi_3Mt...",
///   "amount_minor": 15000,
///   "currency": "usd"
/// }
/// ```
pub async fn create_intent(
    State(state): State<AppState>,
    Json(request): Json<CreateIntentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let ticket = state
        .reconciler
        .create_payment_intent(request.invoice_id)
        .await?;

    Ok((StatusCode::CREATED, Json(ticket)))
}

/// Verify a completed payment and settle the invoice.
///
/// # Request Body
///
/// ```json
/// { "invoice_id": 42, "external_reference": "pi_3Mt..." }
/// ```
///
/// Safe to call any number of times for the same pair.
pub async fn reconcile(
    State(state): State<AppState>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let reference = request.external_reference.trim();
    if reference.is_empty() {
        return Err(AppError::InvalidRequest(
            "external_reference is required".to_string(),
        ));
    }

    let outcome = state
        .reconciler
        .reconcile(request.invoice_id, reference)
        .await?;

    Ok(Json(outcome.into()))
}

/// Processor webhook.
///
/// # Headers
///
/// - `Stripe-Signature: t=<unix>,v1=<hex>`
///
/// # Handled Events
///
/// - `payment_intent.succeeded`
/// - `payment_intent.processing`
/// - `payment_intent.payment_failed`, `payment_intent.canceled`: reopen an
///   invoice left processing by that payment
///
/// Other events are acknowledged and ignored. Failures a redelivery could
/// fix (processor or database unavailable) return an error so the processor
/// retries; anything else is logged and acknowledged.
pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let secret = state
        .webhook_secret
        .as_deref()
        .ok_or(AppError::InvalidSignature)?;

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    stripe_webhook::verify_signature(secret, signature, &body, Utc::now().timestamp()).map_err(
        |e| {
            tracing::warn!(target: "security", error = %e, "Rejected processor webhook");
            AppError::InvalidSignature
        },
    )?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid event body: {}", e)))?;

    let result = match event.event_type.as_str() {
        "payment_intent.succeeded"
        | "payment_intent.processing"
        | "payment_intent.payment_failed"
        | "payment_intent.canceled" => {
            state
                .reconciler
                .handle_notification(&event.data.object.id, event.invoice_id())
                .await
        }
        other => {
            tracing::debug!(event_id = %event.id, event_type = other, "Ignoring processor event");
            Ok(None)
        }
    };

    match result {
        Ok(outcome) => Ok(Json(WebhookAck {
            received: true,
            outcome,
        })),
        Err(e @ (ReconcileError::Gateway(_) | ReconcileError::Store(_))) => Err(e.into()),
        Err(e) => {
            tracing::warn!(
                event_id = %event.id,
                external_reference = %event.data.object.id,
                error = %e,
                "Processor event not applied"
            );
            Ok(Json(WebhookAck {
                received: true,
                outcome: None,
            }))
        }
    }
}
