//! Error types and HTTP error response handling.
//!
//! This module defines the application error and how it is converted
//! into HTTP responses with appropriate status codes and JSON bodies.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    services::{reconciliation::ReconcileError, session::SessionError},
    store::StoreError,
};

/// Message returned for every verification failure. The specific reason is
/// logged, never shown to the payer.
pub const PAYMENT_NOT_CONFIRMED: &str = "Payment could not be confirmed";

/// Application-wide error type.
///
/// # Error Categories
///
/// - **Store Errors**: missing or locked invoices, duplicates, database failures
/// - **Reconciliation Errors**: verification failures and gateway outages
/// - **Authentication Errors**: missing, forged or expired admin sessions
/// - **Validation Errors**: invalid request data
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Returns HTTP 401 Unauthorized.
    #[error("Invalid or expired session")]
    Unauthorized,

    /// Processor webhook signature missing or wrong.
    ///
    /// Returns HTTP 400 Bad Request.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Request body or parameters are invalid.
    ///
    /// Returns HTTP 400 Bad Request.
    /// The String contains details about what was invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        tracing::debug!(error = %err, "Session rejected");
        AppError::Unauthorized
    }
}

impl AppError {
    /// Whether the client may repeat the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Reconcile(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Map each error variant to (HTTP status, error code, message).
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Store(e) => store_parts(e),
            AppError::Reconcile(e) => reconcile_parts(e),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "invalid_session",
                self.to_string(),
            ),
            AppError::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                "invalid_signature",
                self.to_string(),
            ),
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
        }
    }
}

fn store_parts(err: &StoreError) -> (StatusCode, &'static str, String) {
    match err {
        StoreError::NotFound => (
            StatusCode::NOT_FOUND,
            "invoice_not_found",
            "Invoice not found".to_string(),
        ),
        StoreError::InvoiceLocked(status) => (
            StatusCode::CONFLICT,
            "invoice_locked",
            format!("Invoice is {} and can no longer be changed", status),
        ),
        StoreError::DuplicateAccountNumber => (
            StatusCode::CONFLICT,
            "duplicate_account_number",
            "An invoice with this account number already exists".to_string(),
        ),
        StoreError::DuplicateReference(_) => (
            StatusCode::CONFLICT,
            "duplicate_payment",
            "Payment already recorded".to_string(),
        ),
        StoreError::Database(_) => internal(),
    }
}

fn reconcile_parts(err: &ReconcileError) -> (StatusCode, &'static str, String) {
    match err {
        ReconcileError::InvoiceNotFound(_) => (
            StatusCode::NOT_FOUND,
            "invoice_not_found",
            "Invoice not found".to_string(),
        ),
        ReconcileError::PaymentNotFound(_) => (
            StatusCode::NOT_FOUND,
            "payment_not_found",
            "Payment not found".to_string(),
        ),
        ReconcileError::IntegrityViolation { .. }
        | ReconcileError::AmountMismatch { .. }
        | ReconcileError::CurrencyMismatch { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "payment_not_confirmed",
            PAYMENT_NOT_CONFIRMED.to_string(),
        ),
        ReconcileError::PaymentIncomplete(status) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "payment_incomplete",
            format!("{} (status: {})", PAYMENT_NOT_CONFIRMED, status),
        ),
        ReconcileError::InvoiceNotPayable(status) => (
            StatusCode::CONFLICT,
            "invoice_not_payable",
            format!("Invoice is {} and cannot take a new payment", status),
        ),
        ReconcileError::Gateway(_) => (
            StatusCode::BAD_GATEWAY,
            "gateway_unavailable",
            "Payment processor unavailable, please retry".to_string(),
        ),
        ReconcileError::ConflictAlreadySettled(_) => (
            StatusCode::CONFLICT,
            "already_settled",
            "Payment was already recorded".to_string(),
        ),
        ReconcileError::Store(e) => store_parts(e),
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "An internal error occurred".to_string(),
    )
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// ```json
/// {
///   "error": {
///     "code": "payment_not_confirmed",
///     "message": "Payment could not be confirmed",
///     "retryable": false
///   }
/// }
/// ```
///
/// # Status Code Mapping
///
/// - not found → 404
/// - verification failure → 422 (generic message)
/// - gateway failure → 502
/// - locked invoice, duplicate, concurrent settlement → 409
/// - invalid session → 401
/// - invalid request or webhook signature → 400
/// - database → 500 (hides details from client)
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
                "retryable": self.is_retryable()
            }
        }));

        (status, body).into_response()
    }
}
