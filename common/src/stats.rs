// Live dashboard counters and snapshot feed
//
// Counts are written straight into `ActivityCounters` by the dispatch engine
// and the scheduler, never reconstructed from the event bus. Snapshots go out
// over a broadcast channel, so a slow subscriber loses the oldest snapshots
// instead of holding anything up.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::config::FeedConfig;
use crate::errors::ScheduleError;
use crate::hub::ConnectionHub;
use crate::schedule::parse_timezone;
use crate::scheduler::PlanScheduler;

/// Snapshot pushed to dashboard subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub total_count_of_messages: u64,
    pub today_count_of_messages: u64,
    pub total_count_of_endpoints: usize,
    /// Messages per second over the rate window
    pub speed_of_messages: f64,
    pub total_count_of_plans: usize,
    pub today_count_of_plan_executions: u64,
}

#[derive(Debug)]
struct Counters {
    total_messages: u64,
    today_messages: u64,
    today_plan_executions: u64,
    day: Option<NaiveDate>,
    recent: VecDeque<DateTime<Utc>>,
    window: ChronoDuration,
    timezone: Tz,
}

impl Counters {
    fn new(window: ChronoDuration, timezone: Tz) -> Self {
        Self {
            total_messages: 0,
            today_messages: 0,
            today_plan_executions: 0,
            day: None,
            recent: VecDeque::new(),
            window,
            timezone,
        }
    }

    /// Reset the "today" counters when `now` falls on a new local day
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.timezone).date_naive();
        if self.day != Some(today) {
            if self.day.is_some() {
                debug!(day = %today, "Day boundary crossed, resetting daily counters");
            }
            self.day = Some(today);
            self.today_messages = 0;
            self.today_plan_executions = 0;
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.window;
        while self.recent.front().is_some_and(|at| *at <= horizon) {
            self.recent.pop_front();
        }
    }

    fn record_message(&mut self, at: DateTime<Utc>) {
        self.roll_day(at);
        self.total_messages += 1;
        self.today_messages += 1;
        self.recent.push_back(at);
        self.prune(at);
    }

    fn record_plan_execution(&mut self, at: DateTime<Utc>) {
        self.roll_day(at);
        self.today_plan_executions += 1;
    }

    fn speed(&mut self, now: DateTime<Utc>) -> f64 {
        self.prune(now);
        let seconds = self.window.num_milliseconds() as f64 / 1000.0;
        if seconds <= 0.0 {
            return 0.0;
        }
        self.recent.len() as f64 / seconds
    }
}

/// Message and plan-execution tallies shared by every writer
#[derive(Debug)]
pub struct ActivityCounters {
    inner: Mutex<Counters>,
}

impl ActivityCounters {
    pub fn new(config: &FeedConfig) -> Result<Self, ScheduleError> {
        let timezone = parse_timezone(&config.timezone)?;
        let window = ChronoDuration::seconds(config.rate_window_seconds.max(1) as i64);
        Ok(Self {
            inner: Mutex::new(Counters::new(window, timezone)),
        })
    }

    /// Count one finished dispatch
    pub async fn record_message(&self, at: DateTime<Utc>) {
        self.inner.lock().await.record_message(at);
    }

    /// Count one plan firing
    pub async fn record_plan_execution(&self, at: DateTime<Utc>) {
        self.inner.lock().await.record_plan_execution(at);
    }
}

/// Publishes periodic snapshots of the counters and the live registries
pub struct MetricsPublisher {
    counters: Arc<ActivityCounters>,
    hub: Arc<ConnectionHub>,
    scheduler: Arc<PlanScheduler>,
    feed: broadcast::Sender<FeedSnapshot>,
    config: FeedConfig,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl MetricsPublisher {
    pub fn new(
        config: FeedConfig,
        counters: Arc<ActivityCounters>,
        hub: Arc<ConnectionHub>,
        scheduler: Arc<PlanScheduler>,
    ) -> Self {
        let (feed, _) = broadcast::channel(config.subscriber_buffer.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            counters,
            hub,
            scheduler,
            feed,
            config,
            stopped: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Subscribe to snapshots; lagging receivers skip to the newest ones
    pub fn subscribe(&self) -> broadcast::Receiver<FeedSnapshot> {
        self.feed.subscribe()
    }

    pub fn counters(&self) -> &Arc<ActivityCounters> {
        &self.counters
    }

    /// Current view of the counters at `now`
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> FeedSnapshot {
        let total_count_of_endpoints = self.hub.endpoint_count().await;
        let total_count_of_plans = self.scheduler.plan_count().await;

        let mut counters = self.counters.inner.lock().await;
        counters.roll_day(now);
        FeedSnapshot {
            total_count_of_messages: counters.total_messages,
            today_count_of_messages: counters.today_messages,
            total_count_of_endpoints,
            speed_of_messages: counters.speed(now),
            total_count_of_plans,
            today_count_of_plan_executions: counters.today_plan_executions,
        }
    }

    /// Build and broadcast a snapshot; returns the number of receivers
    pub async fn publish(&self, now: DateTime<Utc>) -> usize {
        let snapshot = self.snapshot_at(now).await;
        self.feed.send(snapshot).unwrap_or(0)
    }

    /// Publish on the configured interval until stopped
    #[instrument(skip_all)]
    pub async fn run(&self) {
        info!(
            publish_interval_ms = self.config.publish_interval_ms,
            rate_window_seconds = self.config.rate_window_seconds,
            "Starting metrics publisher"
        );

        let mut ticker = interval(self.config.publish_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !self.stopped.load(Ordering::Acquire) {
            tokio::select! {
                _ = ticker.tick() => {
                    let receivers = self.publish(Utc::now()).await;
                    debug!(receivers = receivers, "Published feed snapshot");
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Metrics publisher stopped");
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }
}
