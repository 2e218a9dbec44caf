// Provider directory and outbound channel seam

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{Provider, Realm, RecipientOutcome};

/// Delivery integration for non-websocket provider kinds (email, sms, ...)
///
/// Implementations report one outcome per recipient they attempted. An empty
/// result means nothing was addressed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn deliver(&self, provider: &Provider, realm: &Realm) -> Vec<RecipientOutcome>;
}

/// In-memory provider directory keyed by provider id
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a provider, returning the previous definition
    pub async fn upsert(&self, provider: Provider) -> Option<Provider> {
        tracing::debug!(provider_id = %provider.id, kind = %provider.kind, "Upserting provider");
        self.providers
            .write()
            .await
            .insert(provider.id.clone(), provider)
    }

    pub async fn remove(&self, id: &str) -> Option<Provider> {
        self.providers.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Provider> {
        self.providers.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.providers.read().await.len()
    }
}
