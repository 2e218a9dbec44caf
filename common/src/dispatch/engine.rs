// Dispatch engine: resolve, fan out, aggregate, record

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::address;
use crate::dispatch::frame::WebsocketConfig;
use crate::dispatch::providers::{OutboundChannel, ProviderRegistry};
use crate::errors::DispatchError;
use crate::events::{CoreEvent, EventBus};
use crate::hub::ConnectionHub;
use crate::models::{
    DeliveryStatus, ExecutionRequest, MessageRecord, Provider, ProviderKind, PushOutcome, Realm,
    RecipientOutcome, SendReceipt,
};
use crate::scheduler::{ExecutionOutcome, PlanExecutor};
use crate::stats::ActivityCounters;
use crate::store::MessageStore;
use crate::telemetry;

/// Ties address resolution, the hub and outbound channels together
pub struct DispatchEngine {
    hub: Arc<ConnectionHub>,
    providers: Arc<ProviderRegistry>,
    channels: HashMap<ProviderKind, Arc<dyn OutboundChannel>>,
    messages: Arc<dyn MessageStore>,
    events: EventBus,
    counters: Option<Arc<ActivityCounters>>,
}

impl DispatchEngine {
    pub fn new(
        hub: Arc<ConnectionHub>,
        providers: Arc<ProviderRegistry>,
        messages: Arc<dyn MessageStore>,
        events: EventBus,
    ) -> Self {
        Self {
            hub,
            providers,
            channels: HashMap::new(),
            messages,
            events,
            counters: None,
        }
    }

    /// Register the integration that delivers a non-websocket provider kind
    pub fn with_channel(mut self, kind: ProviderKind, channel: Arc<dyn OutboundChannel>) -> Self {
        self.channels.insert(kind, channel);
        self
    }

    /// Tally every finished dispatch into the feed counters
    pub fn with_counters(mut self, counters: Arc<ActivityCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Deliver a realm through a provider and record the terminal status
    ///
    /// Unknown providers and kinds without a channel reject the whole
    /// dispatch. Per-recipient failures only shape the aggregate status.
    #[instrument(skip(self, realm), fields(action = %realm.action))]
    pub async fn dispatch(
        &self,
        provider_id: &str,
        realm: Realm,
    ) -> Result<MessageRecord, DispatchError> {
        let provider = self
            .providers
            .get(provider_id)
            .await
            .ok_or_else(|| DispatchError::UnknownProvider(provider_id.to_string()))?;

        let channel = match provider.kind {
            ProviderKind::Websocket => None,
            kind => Some(
                self.channels
                    .get(&kind)
                    .cloned()
                    .ok_or(DispatchError::NoChannel(kind))?,
            ),
        };

        let record = MessageRecord::queued(provider.id.clone(), realm);
        let message_id = record.id;
        let realm = record.realm.clone();
        self.messages.insert(record).await?;

        let started = Instant::now();
        let outcomes = match channel {
            None => self.fan_out(&provider, &realm).await,
            Some(channel) => channel.deliver(&provider, &realm).await,
        };

        let delivered = outcomes.iter().filter(|o| o.outcome.is_delivered()).count();
        let status = DeliveryStatus::aggregate(outcomes.len(), delivered);
        let record = self.messages.complete(message_id, status, outcomes).await?;

        telemetry::record_message(status);
        if let Some(counters) = &self.counters {
            counters.record_message(record.updated_at).await;
        }
        telemetry::record_dispatch_duration(provider.kind.as_str(), started.elapsed().as_secs_f64());

        if status == DeliveryStatus::Failed {
            warn!(
                message_id = %message_id,
                provider_id = %provider.id,
                recipients = record.recipients,
                "Dispatch reached no recipient"
            );
        } else {
            info!(
                message_id = %message_id,
                provider_id = %provider.id,
                status = status.as_str(),
                recipients = record.recipients,
                delivered = record.delivered,
                "Dispatch finished"
            );
        }

        self.events.publish(CoreEvent::Dispatched {
            message_id,
            provider_id: provider.id.clone(),
            status,
            recipients: record.recipients,
            delivered: record.delivered,
            at: record.updated_at,
        });

        Ok(record)
    }

    /// Direct send entry point
    pub async fn send(&self, provider_id: &str, realm: Realm) -> Result<SendReceipt, DispatchError> {
        let record = self.dispatch(provider_id, realm).await?;
        Ok(SendReceipt::from(&record))
    }

    pub async fn message(&self, id: Uuid) -> Result<Option<MessageRecord>, DispatchError> {
        Ok(self.messages.get(id).await?)
    }

    pub async fn recent_messages(&self, limit: usize) -> Result<Vec<MessageRecord>, DispatchError> {
        Ok(self.messages.recent(limit).await?)
    }

    /// Push one frame to every resolved connection in parallel
    async fn fan_out(&self, provider: &Provider, realm: &Realm) -> Vec<RecipientOutcome> {
        let snapshot = self.hub.snapshot().await;
        let targets = address::resolve_realm(realm, &snapshot);
        drop(snapshot);

        if targets.is_empty() {
            debug!("Address expressions resolved to no connection");
            return Vec::new();
        }

        let frame = match WebsocketConfig::from_provider(provider).and_then(|config| config.encode(realm)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(provider_id = %provider.id, error = %e, "Cannot frame message for provider");
                let reason = e.to_string();
                return targets
                    .into_iter()
                    .map(|recipient| RecipientOutcome {
                        recipient,
                        outcome: PushOutcome::TransportError(reason.clone()),
                    })
                    .collect();
            }
        };

        let pushes = targets.into_iter().map(|recipient| {
            let frame = frame.clone();
            async move {
                let outcome = self.hub.push_text(&recipient, frame).await;
                RecipientOutcome { recipient, outcome }
            }
        });
        join_all(pushes).await
    }
}

#[async_trait]
impl PlanExecutor for DispatchEngine {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, DispatchError> {
        let record = self
            .dispatch(&request.provider, request.message.clone())
            .await?;
        Ok(ExecutionOutcome {
            message_id: record.id,
            status: record.status,
            finished_at: Utc::now(),
        })
    }
}
