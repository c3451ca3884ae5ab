//! HTTP handlers for invoice administration.
//!
//! Everything except `login` sits behind the admin session middleware.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AppState,
    error::AppError,
    models::{
        invoice::{CreateInvoiceRequest, InvoiceResponse, UpdateInvoiceRequest},
        payment::PaymentResponse,
    },
    services::{
        invoice_service,
        session::{AdminClaims, verify_password},
    },
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct MarkOverdueResponse {
    pub updated: u64,
}

/// Exchange the admin password for a session token.
///
/// # Request Body
///
/// ```json
/// { "password": "..." }
/// ```
///
/// # Response
///
/// ```json
/// {
///   "token": "7b22737562...9f3a",
///   "expires_at": "2026-03-01T11:30:00Z"
/// }
/// ```
///
/// Send the token as `Authorization: Bearer <token>` on admin routes.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    if !verify_password(&state.admin_password_hash, &request.password) {
        tracing::warn!(target: "security", "Failed admin login");
        return Err(AppError::Unauthorized);
    }

    let session = state.sessions.issue("admin")?;
    tracing::info!(jti = %session.claims.jti, "Admin session issued");

    Ok(Json(LoginResponse {
        expires_at: session.expires_at(),
        token: session.token,
    }))
}

/// List all invoices, newest first.
pub async fn list_invoices(
    State(state): State<AppState>,
) -> Result<Json<Vec<InvoiceResponse>>, AppError> {
    let invoices = state.store.list_invoices().await?;
    Ok(Json(invoices.into_iter().map(Into::into).collect()))
}

/// Create an invoice.
///
/// # Request Body
///
/// ```json
/// {
///   "account_number": "ACC-1001",
///   "customer_name": "Jane Doe",
///   "customer_email": "jane@example.com",
///   "amount": "150.00",
///   "description": "Lawn care, March",
///   "due_date": "2026-04-01"
/// }
/// ```
///
/// Returns 201 Created with the full invoice. A notification is sent in the
/// background.
pub async fn create_invoice(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Json(request): Json<CreateInvoiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let invoice =
        invoice_service::create_invoice(state.store.as_ref(), state.notifier.clone(), request)
            .await?;
    tracing::debug!(jti = %claims.jti, invoice_id = invoice.id, "Admin created invoice");

    Ok((StatusCode::CREATED, Json(InvoiceResponse::from(invoice))))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = invoice_service::get_invoice(state.store.as_ref(), id).await?;
    Ok(Json(invoice.into()))
}

/// Edit an invoice. All body fields are optional.
///
/// Returns 409 Conflict for paid invoices, and for amount edits while a
/// payment is processing.
pub async fn update_invoice(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateInvoiceRequest>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = invoice_service::update_invoice(state.store.as_ref(), id, request).await?;
    tracing::debug!(jti = %claims.jti, invoice_id = id, "Admin updated invoice");

    Ok(Json(invoice.into()))
}

/// Delete an unpaid or overdue invoice.
///
/// Returns 204 No Content on success.
pub async fn delete_invoice(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    invoice_service::delete_invoice(state.store.as_ref(), id).await?;
    tracing::debug!(jti = %claims.jti, invoice_id = id, "Admin deleted invoice");

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_payments(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<PaymentResponse>>, AppError> {
    let payments = invoice_service::list_payments(state.store.as_ref(), id).await?;
    Ok(Json(payments.into_iter().map(Into::into).collect()))
}

/// Run the overdue sweep now.
pub async fn mark_overdue(
    State(state): State<AppState>,
) -> Result<Json<MarkOverdueResponse>, AppError> {
    let today = Utc::now().date_naive();
    let updated = invoice_service::mark_overdue(state.store.as_ref(), today).await?;
    Ok(Json(MarkOverdueResponse { updated }))
}
