// Core event bus shared by the hub, dispatcher, scheduler and observers

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ConnectionId, DeliveryStatus, ExecutionStatus, PushOutcome};

/// Events published by the core components
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    ConnectionOpened {
        connection_id: ConnectionId,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
    },
    Associated {
        connection_id: ConnectionId,
        external_id: String,
    },
    /// Client frame that is not an association payload
    Inbound {
        connection_id: ConnectionId,
        text: String,
    },
    Push {
        connection_id: ConnectionId,
        #[serde(flatten)]
        outcome: PushOutcome,
    },
    Dispatched {
        message_id: Uuid,
        provider_id: String,
        status: DeliveryStatus,
        recipients: usize,
        delivered: usize,
        at: DateTime<Utc>,
    },
    PlanFired {
        plan_id: String,
        firing_id: Uuid,
        trigger: &'static str,
        sub_plans: usize,
        at: DateTime<Utc>,
    },
    PlanRetired {
        plan_id: String,
    },
    PlanDisabled {
        plan_id: String,
        reason: String,
    },
    ExecutionFinished {
        plan_id: String,
        firing_id: Uuid,
        sub_plan: usize,
        status: ExecutionStatus,
    },
    SchedulerSkew {
        expected_ms: u64,
        elapsed_ms: u64,
    },
}

impl CoreEvent {
    /// Stable event name used for SSE and log fields
    pub fn event_type(&self) -> &'static str {
        match self {
            CoreEvent::ConnectionOpened { .. } => "connection_opened",
            CoreEvent::ConnectionClosed { .. } => "connection_closed",
            CoreEvent::Associated { .. } => "associated",
            CoreEvent::Inbound { .. } => "inbound",
            CoreEvent::Push { .. } => "push",
            CoreEvent::Dispatched { .. } => "dispatched",
            CoreEvent::PlanFired { .. } => "plan_fired",
            CoreEvent::PlanRetired { .. } => "plan_retired",
            CoreEvent::PlanDisabled { .. } => "plan_disabled",
            CoreEvent::ExecutionFinished { .. } => "execution_finished",
            CoreEvent::SchedulerSkew { .. } => "scheduler_skew",
        }
    }
}

/// Broadcast event bus. Cloning shares the underlying channel.
///
/// Publishing never waits on subscribers; a subscriber that falls more than
/// `capacity` events behind observes `RecvError::Lagged` and loses the
/// oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn publish(&self, event: CoreEvent) {
        tracing::trace!(
            event_type = event.event_type(),
            subscriber_count = self.tx.receiver_count(),
            "Publishing core event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
