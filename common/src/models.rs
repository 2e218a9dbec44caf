use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a live transport session
pub type ConnectionId = String;

fn new_oid() -> String {
    Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Endpoint Models
// ============================================================================

/// Endpoint is an addressable message recipient
///
/// `external_id` is unique: the hub keeps at most one endpoint per external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default = "new_oid")]
    pub oid: String,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub websockets: Vec<ConnectionId>,
    #[serde(default)]
    pub emails: Vec<String>,
}

impl Endpoint {
    /// Create an endpoint with no tags or channel handles
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            oid: new_oid(),
            external_id: external_id.into(),
            global_id: None,
            tags: Vec::new(),
            websockets: Vec::new(),
            emails: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_websockets<I, S>(mut self, websockets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.websockets = websockets.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ============================================================================
// Connection Models
// ============================================================================

/// Transport a session was established over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportKind {
    Websocket,
}

/// Liveness of a connection as seen by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    Open,
    Closing,
    Closed,
}

/// Result of a single push to a single connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum PushOutcome {
    Delivered,
    NotFound,
    TransportError(String),
}

impl PushOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PushOutcome::Delivered)
    }

    /// Label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            PushOutcome::Delivered => "delivered",
            PushOutcome::NotFound => "not_found",
            PushOutcome::TransportError(_) => "transport_error",
        }
    }
}

// ============================================================================
// Provider Models
// ============================================================================

/// ProviderKind is the channel type a provider integrates with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Websocket,
    Email,
    Webhook,
    Sms,
    VoiceMessage,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Websocket => "websocket",
            ProviderKind::Email => "email",
            ProviderKind::Webhook => "webhook",
            ProviderKind::Sms => "sms",
            ProviderKind::VoiceMessage => "voice_message",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider describes how to reach a channel type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Provider {
    pub fn websocket(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: "websocket".to_string(),
            name: "websocket".to_string(),
            kind: ProviderKind::Websocket,
            config: serde_json::Value::Null,
        }
    }
}

// ============================================================================
// Message Models
// ============================================================================

/// Realm is the delivery bundle handed to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Realm {
    /// Address expressions (`exid:`, `etag:`, literal connection ids)
    #[serde(default)]
    pub connections: Vec<String>,
    /// User ids, addressed as external ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    /// Endpoint oids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Realm {
    pub fn new(
        connections: Vec<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            connections,
            users: Vec::new(),
            endpoints: Vec::new(),
            action: action.into(),
            payload,
        }
    }
}

/// DeliveryStatus is the per-message outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    PartiallySent,
    Failed,
}

impl DeliveryStatus {
    /// Aggregate per-recipient results; zero targets is a vacuous success
    pub fn aggregate(targets: usize, delivered: usize) -> Self {
        if targets == 0 || delivered == targets {
            DeliveryStatus::Sent
        } else if delivered == 0 {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::PartiallySent
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::PartiallySent => "partially_sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Outcome of delivering one message to one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub recipient: String,
    pub outcome: PushOutcome,
}

/// MessageRecord is a dispatched message and its status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub provider_id: String,
    pub realm: Realm,
    pub status: DeliveryStatus,
    pub recipients: usize,
    pub delivered: usize,
    #[serde(default)]
    pub outcomes: Vec<RecipientOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Create a queued record for a new dispatch
    pub fn queued(provider_id: impl Into<String>, realm: Realm) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider_id: provider_id.into(),
            realm,
            status: DeliveryStatus::Queued,
            recipients: 0,
            delivered: 0,
            outcomes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Response to a direct send request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub provider: String,
    pub status: DeliveryStatus,
    pub recipients: usize,
    pub delivered: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&MessageRecord> for SendReceipt {
    fn from(record: &MessageRecord) -> Self {
        Self {
            message_id: record.id,
            provider: record.provider_id.clone(),
            status: record.status,
            recipients: record.recipients,
            delivered: record.delivered,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

// ============================================================================
// Plan Models
// ============================================================================

/// Trigger defines when a plan fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Cron-style repetition; negative `repeat_time` means unbounded
    Repeat {
        repeat_at: String,
        repeat_time: i64,
        start_time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_time: Option<DateTime<Utc>>,
    },
    /// One-shot timer
    Timer {
        timer_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_time: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_time: Option<DateTime<Utc>>,
    },
}

impl Trigger {
    pub fn repeat(repeat_at: impl Into<String>, repeat_time: i64, start_time: DateTime<Utc>) -> Self {
        Trigger::Repeat {
            repeat_at: repeat_at.into(),
            repeat_time,
            start_time,
            end_time: None,
        }
    }

    pub fn timer(timer_at: DateTime<Utc>) -> Self {
        Trigger::Timer {
            timer_at,
            start_time: None,
            end_time: None,
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Repeat { start_time, .. } => Some(*start_time),
            Trigger::Timer { start_time, .. } => *start_time,
        }
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Repeat { end_time, .. } | Trigger::Timer { end_time, .. } => *end_time,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Repeat { .. } => "repeat",
            Trigger::Timer { .. } => "timer",
        }
    }
}

/// SubPlan pairs one provider with one message template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPlan {
    pub provider: String,
    pub message: Realm,
}

/// Plan is a named schedule of triggers and sub-plans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "new_oid")]
    pub id: String,
    pub name: String,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub sub_plans: Vec<SubPlan>,
    #[serde(default)]
    pub is_enabled: bool,
}

/// PlanState is the scheduler's lifecycle view of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Disabled,
    Armed,
    Firing,
    Retired,
}

/// ExecutionStatus of one sub-plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InQueue,
    Succeeded,
    Failed,
}

/// ExecutionRequest is emitted by the scheduler for each sub-plan of a firing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub plan_id: String,
    pub firing_id: Uuid,
    pub sub_plan: usize,
    pub provider: String,
    pub message: Realm,
    pub fired_at: DateTime<Utc>,
}

/// PlanExecution records the outcome of an execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan_id: String,
    pub firing_id: Uuid,
    pub sub_plan: usize,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub fired_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_status() {
        assert_eq!(DeliveryStatus::aggregate(0, 0), DeliveryStatus::Sent);
        assert_eq!(DeliveryStatus::aggregate(3, 3), DeliveryStatus::Sent);
        assert_eq!(DeliveryStatus::aggregate(3, 1), DeliveryStatus::PartiallySent);
        assert_eq!(DeliveryStatus::aggregate(3, 0), DeliveryStatus::Failed);
    }

    #[test]
    fn test_plan_deserializes_create_payload() {
        let plan: Plan = serde_json::from_value(serde_json::json!({
            "name": "every minute",
            "triggers": [{
                "type": "repeat",
                "repeat_at": "0-59/1 * * * *",
                "start_time": "2023-08-02T00:39:59+08:00",
                "repeat_time": 10
            }],
            "sub_plans": [{
                "provider": "64e55ef3b6354fa1d7f2eb24",
                "message": {
                    "connections": ["exid:studio:1"],
                    "action": "say.hello",
                    "payload": "hello"
                }
            }],
            "is_enabled": true
        }))
        .unwrap();

        assert!(plan.is_enabled);
        assert!(!plan.id.is_empty());
        assert_eq!(plan.sub_plans[0].message.action, "say.hello");
        match &plan.triggers[0] {
            Trigger::Repeat { repeat_time, .. } => assert_eq!(*repeat_time, 10),
            other => panic!("unexpected trigger {:?}", other),
        }
    }

    #[test]
    fn test_provider_type_field() {
        let provider: Provider = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "code": "websocket",
            "type": "websocket",
            "name": "ws"
        }))
        .unwrap();
        assert_eq!(provider.kind, ProviderKind::Websocket);
        assert!(provider.config.is_null());
    }

    #[test]
    fn test_delivery_status_serialization() {
        let json = serde_json::to_string(&DeliveryStatus::PartiallySent).unwrap();
        assert_eq!(json, "\"partially_sent\"");
    }
}
