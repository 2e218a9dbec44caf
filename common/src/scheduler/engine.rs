// Plan scheduler engine: tick loop, firing fan-out and plan management

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::errors::{DispatchError, ScheduleError, StoreError};
use crate::events::{CoreEvent, EventBus};
use crate::models::{
    DeliveryStatus, ExecutionRequest, ExecutionStatus, Plan, PlanExecution, PlanState,
};
use crate::schedule::parse_timezone;
use crate::scheduler::plan::PlanEntry;
use crate::stats::ActivityCounters;
use crate::store::ExecutionLog;
use crate::telemetry;

/// Result of executing one request
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub message_id: Uuid,
    pub status: DeliveryStatus,
    pub finished_at: DateTime<Utc>,
}

/// Receives the execution requests produced by plan firings
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, DispatchError>;
}

/// One trigger firing of one plan
#[derive(Debug, Clone)]
pub struct Firing {
    pub plan_id: String,
    pub firing_id: Uuid,
    pub trigger: &'static str,
    pub requests: usize,
}

/// What a single tick did
#[derive(Debug, Default)]
pub struct TickReport {
    /// Active plans that were evaluated
    pub evaluated: usize,
    pub firings: Vec<Firing>,
    pub retired: Vec<String>,
    handles: Vec<JoinHandle<()>>,
}

impl TickReport {
    /// Wait for every execution spawned by this tick
    pub async fn settle(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Execution task failed");
            }
        }
    }
}

/// Time-driven plan engine
pub struct PlanScheduler {
    plans: Mutex<HashMap<String, PlanEntry>>,
    executor: Arc<dyn PlanExecutor>,
    executions: Arc<dyn ExecutionLog>,
    events: EventBus,
    counters: Option<Arc<ActivityCounters>>,
    permits: Arc<Semaphore>,
    timezone: Tz,
    tick_interval: Duration,
    last_tick: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl PlanScheduler {
    pub fn new(
        config: &SchedulerConfig,
        executor: Arc<dyn PlanExecutor>,
        executions: Arc<dyn ExecutionLog>,
        events: EventBus,
    ) -> Result<Self, ScheduleError> {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            plans: Mutex::new(HashMap::new()),
            executor,
            executions,
            events,
            counters: None,
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            timezone: parse_timezone(&config.timezone)?,
            tick_interval: config.tick_interval(),
            last_tick: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Tally every firing into the feed counters
    pub fn with_counters(mut self, counters: Arc<ActivityCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Run the tick loop until `stop` is called
    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            timezone = %self.timezone,
            "Starting plan scheduler"
        );

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !self.stopped.load(Ordering::Acquire) {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.firings.is_empty() {
                        debug!(evaluated = report.evaluated, "No plan due");
                    } else {
                        info!(
                            evaluated = report.evaluated,
                            firings = report.firings.len(),
                            "Plans fired"
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!("Plan scheduler stopped");
    }

    /// Signal the loop to stop; in-flight executions keep running
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    /// One scheduler tick against the wall clock
    pub async fn tick(&self) -> TickReport {
        self.observe_tick(Instant::now()).await;
        self.tick_at(Utc::now()).await
    }

    /// Record a tick arrival; returns true when the gap since the previous
    /// tick exceeded two intervals
    pub async fn observe_tick(&self, at: Instant) -> bool {
        let previous = self.last_tick.lock().await.replace(at);
        let Some(previous) = previous else {
            return false;
        };

        let elapsed = at.saturating_duration_since(previous);
        if elapsed <= self.tick_interval * 2 {
            return false;
        }

        warn!(
            expected_ms = self.tick_interval.as_millis() as u64,
            elapsed_ms = elapsed.as_millis() as u64,
            "Scheduler tick arrived late; due triggers fire once"
        );
        telemetry::record_scheduler_skew();
        self.events.publish(CoreEvent::SchedulerSkew {
            expected_ms: self.tick_interval.as_millis() as u64,
            elapsed_ms: elapsed.as_millis() as u64,
        });
        true
    }

    /// Evaluate every active plan at `now` and hand firings off
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut fired_events = Vec::new();

        {
            let mut plans = self.plans.lock().await;
            for entry in plans.values_mut() {
                if !entry.is_active() {
                    continue;
                }
                report.evaluated += 1;

                for trigger in entry.evaluate(now, self.timezone) {
                    let firing_id = Uuid::new_v4();
                    let requests: Vec<ExecutionRequest> = entry
                        .plan
                        .sub_plans
                        .iter()
                        .enumerate()
                        .map(|(index, sub_plan)| ExecutionRequest {
                            id: Uuid::new_v4(),
                            plan_id: entry.plan.id.clone(),
                            firing_id,
                            sub_plan: index,
                            provider: sub_plan.provider.clone(),
                            message: sub_plan.message.clone(),
                            fired_at: now,
                        })
                        .collect();

                    telemetry::record_plan_firing(trigger);
                    fired_events.push(CoreEvent::PlanFired {
                        plan_id: entry.plan.id.clone(),
                        firing_id,
                        trigger,
                        sub_plans: requests.len(),
                        at: now,
                    });
                    report.firings.push(Firing {
                        plan_id: entry.plan.id.clone(),
                        firing_id,
                        trigger,
                        requests: requests.len(),
                    });

                    for request in requests {
                        report
                            .handles
                            .push(self.spawn_execution(request, entry.in_flight.clone()));
                    }
                }

                if entry.is_spent(self.timezone) {
                    entry.retired = true;
                    report.retired.push(entry.plan.id.clone());
                }
            }
        }

        if let Some(counters) = &self.counters {
            for _ in &report.firings {
                counters.record_plan_execution(now).await;
            }
        }
        for event in fired_events {
            self.events.publish(event);
        }
        for plan_id in &report.retired {
            info!(plan_id = %plan_id, "Plan retired");
            self.events.publish(CoreEvent::PlanRetired {
                plan_id: plan_id.clone(),
            });
        }

        report
    }

    /// Run one execution off the tick path, bounded by the semaphore
    fn spawn_execution(&self, request: ExecutionRequest, in_flight: Arc<AtomicUsize>) -> JoinHandle<()> {
        let executor = self.executor.clone();
        let executions = self.executions.clone();
        let events = self.events.clone();
        let permits = self.permits.clone();
        in_flight.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => executor.execute(&request).await,
                Err(_) => Err(DispatchError::Store(StoreError::Unavailable(
                    "scheduler shut down".to_string(),
                ))),
            };

            let (status, delivery, message_id, reason, finished_at) = match result {
                Ok(outcome) if outcome.status == DeliveryStatus::Failed => (
                    ExecutionStatus::Failed,
                    Some(outcome.status),
                    Some(outcome.message_id),
                    Some("no recipient reached".to_string()),
                    outcome.finished_at,
                ),
                Ok(outcome) => (
                    ExecutionStatus::Succeeded,
                    Some(outcome.status),
                    Some(outcome.message_id),
                    None,
                    outcome.finished_at,
                ),
                Err(e) => {
                    warn!(
                        plan_id = %request.plan_id,
                        sub_plan = request.sub_plan,
                        error = %e,
                        "Plan execution rejected"
                    );
                    (ExecutionStatus::Failed, None, None, Some(e.to_string()), Utc::now())
                }
            };

            let execution = PlanExecution {
                id: request.id,
                plan_id: request.plan_id.clone(),
                firing_id: request.firing_id,
                sub_plan: request.sub_plan,
                status,
                delivery,
                message_id,
                reason,
                fired_at: request.fired_at,
                finished_at,
            };
            if let Err(e) = executions.record(execution).await {
                warn!(error = %e, "Failed to record plan execution");
            }

            events.publish(CoreEvent::ExecutionFinished {
                plan_id: request.plan_id,
                firing_id: request.firing_id,
                sub_plan: request.sub_plan,
                status,
            });
            in_flight.fetch_sub(1, Ordering::AcqRel);
        })
    }

    // ------------------------------------------------------------------
    // Plan management
    // ------------------------------------------------------------------

    /// Insert or replace a plan. Replacing starts a new instance with fresh
    /// counters.
    #[instrument(skip(self, plan), fields(plan_id = %plan.id, plan_name = %plan.name))]
    pub async fn upsert_plan(&self, plan: Plan) -> PlanState {
        let plan_id = plan.id.clone();
        let entry = PlanEntry::new(plan, Utc::now());
        let state = entry.state();
        let defect = entry.defect.as_ref().map(ToString::to_string);

        self.plans.lock().await.insert(plan_id.clone(), entry);

        if let Some(reason) = defect {
            error!(reason = %reason, "Plan has an invalid trigger and was disabled");
            self.events.publish(CoreEvent::PlanDisabled { plan_id, reason });
        } else {
            info!(state = ?state, "Plan upserted");
        }
        state
    }

    pub async fn remove_plan(&self, plan_id: &str) -> Option<Plan> {
        self.plans.lock().await.remove(plan_id).map(|entry| entry.plan)
    }

    /// Enable or disable a plan. Takes effect from the next tick; in-flight
    /// executions are not cancelled. Retired plans stay retired. Repeat
    /// occurrences that fell while disabled are skipped on re-enable.
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, plan_id: &str, enabled: bool) -> Result<PlanState, ScheduleError> {
        let mut plans = self.plans.lock().await;
        let entry = plans
            .get_mut(plan_id)
            .ok_or_else(|| ScheduleError::PlanNotFound(plan_id.to_string()))?;

        if enabled {
            if let Some(defect) = &entry.defect {
                return Err(defect.clone());
            }
        }
        entry.set_enabled(enabled, Utc::now());
        Ok(entry.state())
    }

    pub async fn plan_state(&self, plan_id: &str) -> Option<PlanState> {
        self.plans.lock().await.get(plan_id).map(PlanEntry::state)
    }

    /// Current definition, with bounded `repeat_time` counters as decremented
    pub async fn plan(&self, plan_id: &str) -> Option<Plan> {
        self.plans.lock().await.get(plan_id).map(|entry| entry.plan.clone())
    }

    pub async fn last_error(&self, plan_id: &str) -> Option<ScheduleError> {
        self.plans
            .lock()
            .await
            .get(plan_id)
            .and_then(|entry| entry.defect.clone())
    }

    pub async fn plan_count(&self) -> usize {
        self.plans.lock().await.len()
    }

    /// Total trigger firings of a plan instance
    pub async fn firing_count(&self, plan_id: &str) -> Option<u64> {
        self.plans.lock().await.get(plan_id).map(|entry| entry.firings)
    }

    pub async fn executions_for(&self, plan_id: &str) -> Result<Vec<PlanExecution>, StoreError> {
        self.executions.for_plan(plan_id).await
    }
}
