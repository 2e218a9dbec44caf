// Integration tests for the dispatch and scheduling core
// These tests drive hub, dispatch, scheduler and the metrics feed together

use chrono::{Duration, Utc};
use common::{
    config::{FeedConfig, HubConfig, SchedulerConfig},
    dispatch::{DispatchEngine, ProviderRegistry},
    errors::DispatchError,
    events::EventBus,
    hub::{ConnectionHandle, ConnectionHub, OutboundFrame},
    models::{
        DeliveryStatus, Endpoint, ExecutionStatus, Plan, PlanState, Provider, PushOutcome, Realm,
        SubPlan, TransportKind, Trigger,
    },
    scheduler::PlanScheduler,
    stats::{ActivityCounters, MetricsPublisher},
    store::{MemoryExecutionLog, MemoryMessageStore},
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;

/// Every component wired the way the server wires them
struct Harness {
    events: EventBus,
    hub: Arc<ConnectionHub>,
    dispatch: Arc<DispatchEngine>,
    scheduler: Arc<PlanScheduler>,
    feed: MetricsPublisher,
}

impl Harness {
    async fn new() -> Self {
        let events = EventBus::new(1024);
        let hub = Arc::new(ConnectionHub::new(HubConfig::default(), events.clone()));
        let providers = Arc::new(ProviderRegistry::new());
        providers.upsert(Provider::websocket("p1")).await;

        let counters = Arc::new(
            ActivityCounters::new(&FeedConfig::default()).expect("Failed to build counters"),
        );

        let dispatch = Arc::new(
            DispatchEngine::new(
                hub.clone(),
                providers,
                Arc::new(MemoryMessageStore::new(100)),
                events.clone(),
            )
            .with_counters(counters.clone()),
        );
        let scheduler = Arc::new(
            PlanScheduler::new(
                &SchedulerConfig::default(),
                dispatch.clone(),
                Arc::new(MemoryExecutionLog::new(100)),
                events.clone(),
            )
            .expect("Failed to build scheduler")
            .with_counters(counters.clone()),
        );
        let feed = MetricsPublisher::new(FeedConfig::default(), counters, hub.clone(), scheduler.clone());

        Self {
            events,
            hub,
            dispatch,
            scheduler,
            feed,
        }
    }

    async fn connect(&self, id: &str) -> ConnectionHandle {
        self.hub
            .register(id, None, TransportKind::Websocket)
            .await
            .expect("Failed to register connection")
    }
}

fn realm(connections: &[&str]) -> Realm {
    Realm::new(
        connections.iter().map(|c| c.to_string()).collect(),
        "say.hello",
        json!("hi"),
    )
}

fn received(handle: &mut ConnectionHandle) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = handle.receiver.try_recv() {
        if let OutboundFrame::Text(text) = frame {
            frames.push(serde_json::from_str(&text).expect("Frame is not JSON"));
        }
    }
    frames
}

fn plan(id: &str, trigger: Trigger, connections: &[&str]) -> Plan {
    Plan {
        id: id.to_string(),
        name: format!("{} plan", id),
        triggers: vec![trigger],
        sub_plans: vec![SubPlan {
            provider: "p1".to_string(),
            message: realm(connections),
        }],
        is_enabled: true,
    }
}

#[tokio::test]
async fn test_external_id_dispatch_reaches_endpoint_connection() {
    let harness = Harness::new().await;
    harness
        .hub
        .upsert_endpoint(Endpoint::new("studio:1").with_websockets(["conn-1"]))
        .await;
    let mut conn = harness.connect("conn-1").await;

    let record = harness
        .dispatch
        .dispatch("p1", realm(&["exid:studio:1"]))
        .await
        .unwrap();

    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.recipients, 1);
    assert_eq!(record.delivered, 1);

    let frames = received(&mut conn);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0], json!({"action": "say.hello", "payload": "hi"}));
}

#[tokio::test]
async fn test_endpoint_without_live_connection_is_vacuous_success() {
    let harness = Harness::new().await;
    harness
        .hub
        .upsert_endpoint(Endpoint::new("studio:1").with_websockets(["conn-1"]))
        .await;

    let record = harness
        .dispatch
        .dispatch("p1", realm(&["exid:studio:1"]))
        .await
        .unwrap();

    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.recipients, 0);
    assert!(record.outcomes.is_empty());
}

#[tokio::test]
async fn test_unresolvable_expressions_send_to_nobody() {
    let harness = Harness::new().await;
    let _conn = harness.connect("conn-1").await;

    let record = harness
        .dispatch
        .dispatch("p1", realm(&["exid:ghost", "etag:Nobody", "conn-404", "  "]))
        .await
        .unwrap();

    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.recipients, 0);
}

#[tokio::test]
async fn test_tag_dispatch_deduplicates_union() {
    let harness = Harness::new().await;
    harness
        .hub
        .upsert_endpoint(
            Endpoint::new("studio:1")
                .with_tags(["Admin"])
                .with_websockets(["conn-1", "conn-2"]),
        )
        .await;
    harness
        .hub
        .upsert_endpoint(
            Endpoint::new("studio:2")
                .with_tags(["Admin", "Ops"])
                .with_websockets(["conn-2", "conn-3"]),
        )
        .await;
    harness
        .hub
        .upsert_endpoint(Endpoint::new("studio:3").with_tags(["Ops"]).with_websockets(["conn-4"]))
        .await;

    let mut conns = Vec::new();
    for id in ["conn-1", "conn-2", "conn-3", "conn-4"] {
        conns.push(harness.connect(id).await);
    }

    let record = harness
        .dispatch
        .dispatch("p1", realm(&["#etag:Admin", "etag:Admin"]))
        .await
        .unwrap();

    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.recipients, 3);

    for (index, conn) in conns.iter_mut().enumerate() {
        let expected = if index < 3 { 1 } else { 0 };
        assert_eq!(received(conn).len(), expected, "conn-{}", index + 1);
    }
}

#[tokio::test]
async fn test_association_makes_connection_addressable() {
    let harness = Harness::new().await;
    let mut conn = harness.connect("conn-9").await;

    harness.hub.associate("conn-9", "studio:9").await.unwrap();

    let mut users = realm(&[]);
    users.users = vec!["studio:9".to_string()];
    let record = harness.dispatch.dispatch("p1", users).await.unwrap();

    assert_eq!(record.recipients, 1);
    assert_eq!(received(&mut conn).len(), 1);
}

#[tokio::test]
async fn test_failed_connection_yields_partial_status() {
    let harness = Harness::new().await;
    let mut alive = harness.connect("conn-1").await;
    let gone = harness.connect("conn-2").await;
    drop(gone);

    let record = harness
        .dispatch
        .dispatch("p1", realm(&["conn-1", "conn-2"]))
        .await
        .unwrap();

    assert_eq!(record.status, DeliveryStatus::PartiallySent);
    assert_eq!(record.recipients, 2);
    assert_eq!(record.delivered, 1);
    assert_eq!(received(&mut alive).len(), 1);

    let failed = record
        .outcomes
        .iter()
        .find(|o| o.recipient == "conn-2")
        .unwrap();
    assert!(matches!(failed.outcome, PushOutcome::TransportError(_)));
}

#[tokio::test]
async fn test_unknown_provider_rejects_dispatch() {
    let harness = Harness::new().await;
    let result = harness.dispatch.dispatch("nope", realm(&["conn-1"])).await;

    assert!(matches!(result, Err(DispatchError::UnknownProvider(ref id)) if id == "nope"));
    assert!(harness.dispatch.recent_messages(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_push_after_unregister_is_not_found() {
    let harness = Harness::new().await;
    let _conn = harness.connect("conn-1").await;
    harness.hub.unregister("conn-1").await;

    let outcome = harness.hub.push_text("conn-1", "late").await;
    assert_eq!(outcome, PushOutcome::NotFound);
}

#[tokio::test]
async fn test_single_repeat_fires_once_and_retires() {
    let harness = Harness::new().await;
    let mut conn = harness.connect("conn-1").await;
    let start = Utc::now();

    harness
        .scheduler
        .upsert_plan(plan("once", Trigger::repeat("* * * * *", 1, start), &["conn-1"]))
        .await;

    let report = harness.scheduler.tick_at(start + Duration::minutes(1) + Duration::seconds(1)).await;
    assert_eq!(report.firings.len(), 1);
    assert_eq!(report.retired, vec!["once".to_string()]);
    report.settle().await;

    assert_eq!(harness.scheduler.plan_state("once").await, Some(PlanState::Retired));
    assert_eq!(received(&mut conn).len(), 1);

    let executions = harness.scheduler.executions_for("once").await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Succeeded);
    assert_eq!(executions[0].delivery, Some(DeliveryStatus::Sent));

    // Re-enabling does not reset a spent counter
    assert_eq!(
        harness.scheduler.set_enabled("once", true).await.unwrap(),
        PlanState::Retired
    );
    let report = harness.scheduler.tick_at(start + Duration::minutes(2) + Duration::seconds(1)).await;
    assert!(report.firings.is_empty());
    assert_eq!(received(&mut conn).len(), 0);
}

#[tokio::test]
async fn test_past_timer_fires_exactly_once() {
    let harness = Harness::new().await;
    let mut conn = harness.connect("conn-1").await;
    let now = Utc::now();

    harness
        .scheduler
        .upsert_plan(plan("timer", Trigger::timer(now - Duration::hours(1)), &["conn-1"]))
        .await;

    let report = harness.scheduler.tick_at(now).await;
    assert_eq!(report.firings.len(), 1);
    report.settle().await;

    for minutes in 1..4 {
        let report = harness.scheduler.tick_at(now + Duration::minutes(minutes)).await;
        assert!(report.firings.is_empty());
    }
    assert_eq!(received(&mut conn).len(), 1);
    assert_eq!(harness.scheduler.plan_state("timer").await, Some(PlanState::Retired));
}

#[tokio::test]
async fn test_disabled_plan_stops_firing_from_next_tick() {
    let harness = Harness::new().await;
    let _conn = harness.connect("conn-1").await;
    let start = Utc::now();

    harness
        .scheduler
        .upsert_plan(plan("minutely", Trigger::repeat("* * * * *", -1, start), &["conn-1"]))
        .await;

    let report = harness.scheduler.tick_at(start + Duration::minutes(1) + Duration::seconds(1)).await;
    assert_eq!(report.firings.len(), 1);
    report.settle().await;

    assert_eq!(
        harness.scheduler.set_enabled("minutely", false).await.unwrap(),
        PlanState::Disabled
    );
    for minutes in 2..5 {
        let report = harness.scheduler.tick_at(start + Duration::minutes(minutes) + Duration::seconds(1)).await;
        assert!(report.firings.is_empty());
    }
    assert_eq!(harness.scheduler.firing_count("minutely").await, Some(1));
}

#[tokio::test]
async fn test_plan_with_unknown_provider_records_failed_execution() {
    let harness = Harness::new().await;
    let start = Utc::now();
    let mut broken = plan("orphan", Trigger::timer(start), &["conn-1"]);
    broken.sub_plans[0].provider = "missing".to_string();

    harness.scheduler.upsert_plan(broken).await;
    harness.scheduler.tick_at(start).await.settle().await;

    let executions = harness.scheduler.executions_for("orphan").await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].reason.as_deref().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_feed_counts_messages_and_plan_executions() {
    let harness = Harness::new().await;
    let _conn = harness.connect("conn-1").await;
    harness
        .hub
        .upsert_endpoint(Endpoint::new("studio:1").with_websockets(["conn-1"]))
        .await;

    harness.dispatch.dispatch("p1", realm(&["conn-1"])).await.unwrap();
    harness.dispatch.dispatch("p1", realm(&["conn-404"])).await.unwrap();

    let start = Utc::now();
    harness
        .scheduler
        .upsert_plan(plan("timer", Trigger::timer(start), &["exid:studio:1"]))
        .await;
    harness.scheduler.tick_at(start).await.settle().await;

    let snapshot = harness.feed.snapshot_at(Utc::now()).await;

    // Two direct sends plus the plan's dispatch
    assert_eq!(snapshot.total_count_of_messages, 3);
    assert_eq!(snapshot.today_count_of_messages, 3);
    assert_eq!(snapshot.total_count_of_endpoints, 1);
    assert_eq!(snapshot.total_count_of_plans, 1);
    assert_eq!(snapshot.today_count_of_plan_executions, 1);
    assert!(snapshot.speed_of_messages > 0.0);
}

#[tokio::test]
async fn test_feed_counts_survive_event_bus_overflow() {
    let harness = Harness::new().await;
    let mut rx = harness.events.subscribe();

    let ids: Vec<String> = (0..1100).map(|i| format!("conn-{}", i)).collect();
    let mut handles = Vec::new();
    for id in &ids {
        handles.push(harness.connect(id).await);
    }

    harness.dispatch.dispatch("p1", realm(&["conn-0"])).await.unwrap();
    let wide = Realm::new(ids.clone(), "say.hello", json!("hi"));
    let record = harness.dispatch.dispatch("p1", wide).await.unwrap();
    assert_eq!(record.delivered, 1100);

    // One push event per recipient overruns the 1024-slot bus
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(_))));

    let snapshot = harness.feed.snapshot_at(Utc::now()).await;
    assert_eq!(snapshot.total_count_of_messages, 2);
    assert_eq!(snapshot.today_count_of_messages, 2);
    drop(handles);
}
