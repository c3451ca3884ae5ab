//! Sandbox gateway that keeps payment intents in memory.
//!
//! Stands in for the processor in tests: intents can be seeded or moved
//! between statuses directly, and the gateway can be switched offline to
//! simulate transport failures.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CreatedIntent, GatewayError, IntentMetadata, IntentStatus, PaymentGateway, PaymentIntent};

#[derive(Debug, Default, Clone)]
pub struct InMemoryGateway {
    intents: Arc<RwLock<HashMap<String, PaymentIntent>>>,
    offline: Arc<AtomicBool>,
    lookups: Arc<AtomicUsize>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an intent.
    pub async fn put(&self, intent: PaymentIntent) {
        self.intents
            .write()
            .await
            .insert(intent.external_reference.clone(), intent);
    }

    /// Move an existing intent to a new status. Returns false if unknown.
    pub async fn set_status(&self, external_reference: &str, status: IntentStatus) -> bool {
        match self.intents.write().await.get_mut(external_reference) {
            Some(intent) => {
                intent.status = status;
                true
            }
            None => false,
        }
    }

    /// While offline every call fails with `GatewayError::Transport`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `get_intent` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), GatewayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("sandbox gateway offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<CreatedIntent, GatewayError> {
        self.check_online()?;

        let external_reference = format!("pi_sandbox_{}", Uuid::new_v4().simple());
        let intent = PaymentIntent {
            external_reference: external_reference.clone(),
            status: IntentStatus::RequiresPaymentMethod,
            amount_minor,
            currency: currency.to_lowercase(),
            metadata_invoice_id: Some(metadata.invoice_id),
            payment_method_kind: "card".to_string(),
        };
        self.put(intent).await;

        Ok(CreatedIntent {
            client_token: format!("{}_secret", external_reference),
            external_reference,
        })
    }

    async fn get_intent(&self, external_reference: &str) -> Result<PaymentIntent, GatewayError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        self.intents
            .read()
            .await
            .get(external_reference)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(external_reference.to_string()))
    }
}
