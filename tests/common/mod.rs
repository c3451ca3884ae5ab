use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use rust_decimal::Decimal;
use serde_json::Value;
use argon2::{Algorithm, Argon2, Params, PasswordHasher, Version, password_hash::SaltString};
use tower::util::ServiceExt;

use invoice_billing_server::{
    AppState, app,
    gateway::{InMemoryGateway, IntentStatus, PaymentIntent},
    models::invoice::{Invoice, NewInvoice},
    services::{notifier::LogNotifier, reconciliation::Reconciler, session::SessionSigner},
    store::{InMemoryInvoiceStore, InvoiceStore},
};

pub const ADMIN_PASSWORD: &str = "correct horse battery staple";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Low-cost argon2id hash of `ADMIN_PASSWORD`, so logins stay fast in tests.
fn admin_password_hash() -> String {
    let params = Params::new(1024, 1, 1, None).unwrap();
    let salt = SaltString::encode_b64(b"integration-salt").unwrap();
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(ADMIN_PASSWORD.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

pub struct TestApp {
    pub router: Router,
    pub store: InMemoryInvoiceStore,
    pub gateway: InMemoryGateway,
}

impl TestApp {
    pub fn spawn() -> Self {
        let store = InMemoryInvoiceStore::new();
        let gateway = InMemoryGateway::new();
        let shared_store: Arc<dyn InvoiceStore> = Arc::new(store.clone());

        let state = AppState {
            store: shared_store.clone(),
            reconciler: Reconciler::new(shared_store, Arc::new(gateway.clone()), "usd"),
            notifier: Arc::new(LogNotifier),
            sessions: SessionSigner::new(
                "integration-test-session-secret-0123456789",
                chrono::Duration::minutes(30),
            ),
            admin_password_hash: admin_password_hash(),
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        };

        Self {
            router: app(state),
            store,
            gateway,
        }
    }

    pub async fn seed_invoice(&self, account_number: &str, amount: Decimal) -> Invoice {
        self.store
            .insert_invoice(NewInvoice {
                account_number: account_number.to_string(),
                customer_name: "Jane Doe".to_string(),
                customer_email: "jane@example.com".to_string(),
                amount,
                description: "Lawn care".to_string(),
                due_date: None,
            })
            .await
            .unwrap()
    }

    pub async fn seed_intent(&self, reference: &str, invoice_id: i64, amount_minor: i64, status: &str) {
        self.gateway
            .put(PaymentIntent {
                external_reference: reference.to_string(),
                status: IntentStatus::parse(status),
                amount_minor,
                currency: "usd".to_string(),
                metadata_invoice_id: Some(invoice_id),
                payment_method_kind: "card".to_string(),
            })
            .await;
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        self.send(builder.body(body).unwrap()).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub async fn login(&self) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/api/admin/login",
                Some(serde_json::json!({ "password": ADMIN_PASSWORD })),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }
}
