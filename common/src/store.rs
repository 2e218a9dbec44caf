// In-memory message and execution stores
//
// Both stores are bounded: once `capacity` records are held, the oldest one
// is evicted. Nothing survives a restart.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{DeliveryStatus, MessageRecord, PlanExecution, RecipientOutcome};

/// Storage for dispatched messages and their delivery status
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, record: MessageRecord) -> Result<(), StoreError>;

    /// Move a message to its terminal status
    async fn complete(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        outcomes: Vec<RecipientOutcome>,
    ) -> Result<MessageRecord, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<MessageRecord>, StoreError>;

    /// Most recent messages first
    async fn recent(&self, limit: usize) -> Result<Vec<MessageRecord>, StoreError>;
}

/// Storage for plan execution outcomes
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn record(&self, execution: PlanExecution) -> Result<(), StoreError>;

    /// Executions of one plan, oldest first
    async fn for_plan(&self, plan_id: &str) -> Result<Vec<PlanExecution>, StoreError>;
}

struct Bounded<T> {
    order: VecDeque<Uuid>,
    items: HashMap<Uuid, T>,
    capacity: usize,
}

impl<T> Bounded<T> {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            items: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: Uuid, item: T) {
        if self.items.insert(id, item).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.items.remove(&evicted);
            }
        }
    }

    fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.order.iter().filter_map(|id| self.items.get(id))
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Bounded in-memory `MessageStore`
pub struct MemoryMessageStore {
    inner: RwLock<Bounded<MessageRecord>>,
}

impl MemoryMessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Bounded::new(capacity)),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, record: MessageRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .map_err(poisoned)?
            .insert(record.id, record);
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        outcomes: Vec<RecipientOutcome>,
    ) -> Result<MessageRecord, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let record = inner
            .items
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        record.recipients = outcomes.len();
        record.delivered = outcomes.iter().filter(|o| o.outcome.is_delivered()).count();
        record.status = status;
        record.outcomes = outcomes;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.inner.read().map_err(poisoned)?.items.get(&id).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.iter().rev().take(limit).cloned().collect())
    }
}

/// Bounded in-memory `ExecutionLog`
pub struct MemoryExecutionLog {
    inner: RwLock<Bounded<PlanExecution>>,
}

impl MemoryExecutionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Bounded::new(capacity)),
        }
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn record(&self, execution: PlanExecution) -> Result<(), StoreError> {
        self.inner
            .write()
            .map_err(poisoned)?
            .insert(execution.id, execution);
        Ok(())
    }

    async fn for_plan(&self, plan_id: &str) -> Result<Vec<PlanExecution>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .iter()
            .filter(|execution| execution.plan_id == plan_id)
            .cloned()
            .collect())
    }
}
