use std::sync::Arc;

use common::catalog::{self, Catalog, ImportResult};
use common::config::Settings;
use common::dispatch::{DispatchEngine, ProviderRegistry};
use common::events::EventBus;
use common::hub::ConnectionHub;
use common::scheduler::PlanScheduler;
use common::stats::{ActivityCounters, MetricsPublisher};
use common::store::{MemoryExecutionLog, MemoryMessageStore};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ConnectionHub>,
    pub dispatch: Arc<DispatchEngine>,
    pub scheduler: Arc<PlanScheduler>,
    pub feed: Arc<MetricsPublisher>,
    pub events: EventBus,
    pub config: Arc<Settings>,
}

impl AppState {
    /// Wire the component graph. Nothing is started here.
    pub fn new(config: Settings) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let hub = Arc::new(ConnectionHub::new(config.hub.clone(), events.clone()));
        let providers = Arc::new(ProviderRegistry::new());
        let messages = Arc::new(MemoryMessageStore::new(config.dispatch.message_history));
        let counters = Arc::new(ActivityCounters::new(&config.feed)?);

        let dispatch = Arc::new(
            DispatchEngine::new(hub.clone(), providers, messages, events.clone())
                .with_counters(counters.clone()),
        );

        let scheduler = Arc::new(
            PlanScheduler::new(
                &config.scheduler,
                dispatch.clone(),
                Arc::new(MemoryExecutionLog::new(config.scheduler.execution_history)),
                events.clone(),
            )?
            .with_counters(counters.clone()),
        );

        let feed = Arc::new(MetricsPublisher::new(
            config.feed.clone(),
            counters,
            hub.clone(),
            scheduler.clone(),
        ));

        Ok(Self {
            hub,
            dispatch,
            scheduler,
            feed,
            events,
            config: Arc::new(config),
        })
    }

    /// Seed providers, endpoints and plans from the configured catalog file
    pub async fn import_catalog(&self) -> anyhow::Result<Vec<ImportResult>> {
        let Some(path) = self.config.catalog.path.as_ref() else {
            return Ok(Vec::new());
        };
        let catalog = Catalog::load(path)?;
        Ok(catalog::import(
            catalog,
            self.dispatch.providers(),
            &self.hub,
            &self.scheduler,
        )
        .await)
    }
}
