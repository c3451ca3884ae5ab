//! Invoice billing server - main application entry point.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool and run migrations
//! 3. Wire the store, payment gateway, notifier and session signer
//! 4. Start the background overdue sweep
//! 5. Build the HTTP router and start the server on the configured port

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method, header};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use invoice_billing_server::{
    AppState, app,
    config::Config,
    db,
    gateway::StripeGateway,
    services::{
        invoice_service,
        notifier::{InvoiceNotifier, LogNotifier, WebhookNotifier},
        reconciliation::Reconciler,
        session::SessionSigner,
    },
    store::{InvoiceStore, PgInvoiceStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().context("Invalid configuration")?;
    tracing::info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn InvoiceStore> = Arc::new(PgInvoiceStore::new(pool));

    let gateway = StripeGateway::new(
        config.stripe_api_base.clone(),
        config.stripe_secret_key.clone(),
        config.gateway_timeout(),
    )?;
    let reconciler = Reconciler::new(
        store.clone(),
        Arc::new(gateway),
        config.payment_currency.clone(),
    );

    let notifier: Arc<dyn InvoiceNotifier> = match &config.notify_webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Invoice notifications enabled");
            Arc::new(WebhookNotifier::new(
                url.clone(),
                config.notify_webhook_secret.clone(),
            )?)
        }
        None => Arc::new(LogNotifier),
    };

    if config.stripe_webhook_secret.is_none() {
        tracing::info!("STRIPE_WEBHOOK_SECRET not set; processor webhook disabled");
    }

    let state = AppState {
        store: store.clone(),
        reconciler,
        notifier,
        sessions: SessionSigner::new(&config.session_secret, config.session_ttl()),
        admin_password_hash: config.admin_password_hash.trim().to_string(),
        webhook_secret: config.stripe_webhook_secret.clone(),
    };

    if let Some(period) = config.overdue_sweep_interval() {
        spawn_overdue_sweep(store, period);
    }

    let mut router = app(state);
    if let Some(origin) = &config.cors_allowed_origin {
        let origin: HeaderValue = origin
            .parse()
            .context("CORS_ALLOWED_ORIGIN is not a valid header value")?;
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        );
    }

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Periodically mark unpaid invoices past their due date as overdue.
fn spawn_overdue_sweep(store: Arc<dyn InvoiceStore>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let today = Utc::now().date_naive();
            if let Err(e) = invoice_service::mark_overdue(store.as_ref(), today).await {
                tracing::warn!(error = %e, "Overdue sweep failed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
