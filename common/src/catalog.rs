// Catalog seed import for providers, endpoints and plans
//
// Items are parsed and validated one by one. An invalid item is reported and
// skipped; it never aborts the rest of the import.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::dispatch::ProviderRegistry;
use crate::errors::CatalogError;
use crate::hub::ConnectionHub;
use crate::models::{Endpoint, Plan, Provider};
use crate::schedule::validate_trigger;
use crate::scheduler::PlanScheduler;

/// Raw catalog document; items stay untyped until imported
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub providers: Vec<serde_json::Value>,
    pub endpoints: Vec<serde_json::Value>,
    pub plans: Vec<serde_json::Value>,
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Provider,
    Endpoint,
    Plan,
}

/// Import result for a single catalog item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub kind: ItemKind,
    pub id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl ImportResult {
    fn ok(kind: ItemKind, id: String) -> Self {
        Self {
            kind,
            id: Some(id),
            success: true,
            error: None,
        }
    }

    fn failed(kind: ItemKind, id: Option<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        warn!(kind = ?kind, id = ?id, error = %error, "Catalog item skipped");
        Self {
            kind,
            id,
            success: false,
            error: Some(error),
        }
    }
}

/// Load providers, then endpoints, then plans into the running components
#[instrument(skip_all)]
pub async fn import(
    catalog: Catalog,
    providers: &ProviderRegistry,
    hub: &ConnectionHub,
    scheduler: &PlanScheduler,
) -> Vec<ImportResult> {
    let mut results = Vec::new();

    for raw in catalog.providers {
        let provider: Provider = match serde_json::from_value(raw) {
            Ok(provider) => provider,
            Err(e) => {
                results.push(ImportResult::failed(ItemKind::Provider, None, e.to_string()));
                continue;
            }
        };
        if provider.id.trim().is_empty() {
            results.push(ImportResult::failed(ItemKind::Provider, None, "provider id is empty"));
            continue;
        }
        let id = provider.id.clone();
        providers.upsert(provider).await;
        results.push(ImportResult::ok(ItemKind::Provider, id));
    }

    let mut seen_external_ids = HashSet::new();
    for raw in catalog.endpoints {
        let endpoint: Endpoint = match serde_json::from_value(raw) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                results.push(ImportResult::failed(ItemKind::Endpoint, None, e.to_string()));
                continue;
            }
        };
        let external_id = endpoint.external_id.clone();
        if external_id.trim().is_empty() {
            results.push(ImportResult::failed(ItemKind::Endpoint, None, "external_id is empty"));
            continue;
        }
        if !seen_external_ids.insert(external_id.clone()) {
            results.push(ImportResult::failed(
                ItemKind::Endpoint,
                Some(external_id),
                "duplicate external_id",
            ));
            continue;
        }
        hub.upsert_endpoint(endpoint).await;
        results.push(ImportResult::ok(ItemKind::Endpoint, external_id));
    }

    for raw in catalog.plans {
        let plan: Plan = match serde_json::from_value(raw) {
            Ok(plan) => plan,
            Err(e) => {
                results.push(ImportResult::failed(ItemKind::Plan, None, e.to_string()));
                continue;
            }
        };
        match validate_plan(&plan, providers).await {
            Ok(()) => {
                let id = plan.id.clone();
                scheduler.upsert_plan(plan).await;
                results.push(ImportResult::ok(ItemKind::Plan, id));
            }
            Err(error) => results.push(ImportResult::failed(ItemKind::Plan, Some(plan.id), error)),
        }
    }

    let imported = results.iter().filter(|r| r.success).count();
    info!(
        imported = imported,
        skipped = results.len() - imported,
        "Catalog import finished"
    );
    results
}

async fn validate_plan(plan: &Plan, providers: &ProviderRegistry) -> Result<(), String> {
    for trigger in &plan.triggers {
        validate_trigger(trigger).map_err(|e| e.to_string())?;
    }
    for sub_plan in &plan.sub_plans {
        if providers.get(&sub_plan.provider).await.is_none() {
            return Err(format!("unknown provider '{}'", sub_plan.provider));
        }
    }
    Ok(())
}
