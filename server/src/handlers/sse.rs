use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use common::events::CoreEvent;
use futures::stream::Stream;
use serde::Deserialize;
use std::collections::HashSet;
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use tracing::warn;

use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma separated event names, e.g. `dispatched,plan_fired`
    pub types: Option<String>,
}

/// Event names a subscriber asked for; empty means everything
#[derive(Debug, Default)]
struct EventFilter(HashSet<String>);

impl EventFilter {
    fn parse(types: Option<&str>) -> Self {
        let names = types
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Self(names)
    }

    fn admits(&self, event: &CoreEvent) -> bool {
        self.0.is_empty() || self.0.contains(event.event_type())
    }
}

fn to_sse(event: &CoreEvent) -> Option<Event> {
    match Event::default().event(event.event_type()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(event = event.event_type(), error = %e, "Dropping unencodable event");
            None
        }
    }
}

/// Core events as Server-Sent Events, optionally narrowed with `?types=`
#[tracing::instrument(skip(state))]
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let filter = EventFilter::parse(query.types.as_deref());

    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |received| {
        match received {
            Ok(event) if filter.admits(&event) => to_sse(&event).map(Ok),
            Ok(_) => None,
            // Events were lost; the client should refetch state
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Ok(Event::default()
                .event("reconnect")
                .data(skipped.to_string()))),
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retired() -> CoreEvent {
        CoreEvent::PlanRetired {
            plan_id: "p".to_string(),
        }
    }

    #[test]
    fn test_empty_filter_admits_everything() {
        assert!(EventFilter::parse(None).admits(&retired()));
        assert!(EventFilter::parse(Some(" , ")).admits(&retired()));
    }

    #[test]
    fn test_filter_matches_event_names() {
        let filter = EventFilter::parse(Some("dispatched, plan_retired"));
        assert!(filter.admits(&retired()));

        let filter = EventFilter::parse(Some("dispatched"));
        assert!(!filter.admits(&retired()));
    }
}
