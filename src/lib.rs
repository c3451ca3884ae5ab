//! Invoice billing server.
//!
//! Customers look up an invoice by account number and pay it through a
//! payment processor; the server verifies every claimed payment against the
//! processor before marking the invoice paid. Admins manage invoices behind
//! a signed session token.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx, behind the `InvoiceStore` trait
//! - **Payments**: Stripe over reqwest, behind the `PaymentGateway` trait
//! - **Authentication**: HMAC-signed admin session tokens
//! - **Format**: JSON requests/responses

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    services::{notifier::InvoiceNotifier, reconciliation::Reconciler, session::SessionSigner},
    store::InvoiceStore,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InvoiceStore>,
    pub reconciler: Reconciler,
    pub notifier: Arc<dyn InvoiceNotifier>,
    pub sessions: SessionSigner,
    /// PHC-format argon2 hash of the admin password
    pub admin_password_hash: String,
    /// `None` disables the processor webhook route
    pub webhook_secret: Option<String>,
}

/// Build the HTTP router.
pub fn app(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/api/admin/invoices",
            get(handlers::admin::list_invoices).post(handlers::admin::create_invoice),
        )
        .route(
            "/api/admin/invoices/mark-overdue",
            post(handlers::admin::mark_overdue),
        )
        .route(
            "/api/admin/invoices/{id}",
            get(handlers::admin::get_invoice)
                .patch(handlers::admin::update_invoice)
                .delete(handlers::admin::delete_invoice),
        )
        .route(
            "/api/admin/invoices/{id}/payments",
            get(handlers::admin::list_payments),
        )
        // Apply session middleware to all routes in this group
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::admin_auth,
        ));

    let mut public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api/invoices/lookup/{account_number}",
            get(handlers::invoices::lookup_invoice),
        )
        .route(
            "/api/payments/intent",
            post(handlers::payments::create_intent),
        )
        .route(
            "/api/payments/reconcile",
            post(handlers::payments::reconcile),
        )
        .route("/api/admin/login", post(handlers::admin::login));

    if state.webhook_secret.is_some() {
        public_routes = public_routes.route(
            "/api/payments/webhook",
            post(handlers::payments::processor_webhook),
        );
    }

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
