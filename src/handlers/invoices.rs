//! Public invoice lookup.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::{
    AppState, error::AppError, models::invoice::PublicInvoiceView,
    services::invoice_service,
};

/// Look up an invoice by account number.
///
/// # Response
///
/// ```json
/// {
///   "id": 42,
///   "account_number": "ACC-1001",
///   "customer_name": "Jane Doe",
///   "amount": "150.00",
///   "description": "Lawn care, March",
///   "due_date": "2026-04-01",
///   "status": "unpaid"
/// }
/// ```
///
/// The customer email is never included.
pub async fn lookup_invoice(
    State(state): State<AppState>,
    Path(account_number): Path<String>,
) -> Result<Json<PublicInvoiceView>, AppError> {
    let invoice = invoice_service::lookup_invoice(state.store.as_ref(), &account_number).await?;
    Ok(Json(invoice.into()))
}
