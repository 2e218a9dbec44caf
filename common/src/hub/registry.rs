// Connection hub: live session registry and push routing

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::HubConfig;
use crate::errors::HubError;
use crate::events::{CoreEvent, EventBus};
use crate::hub::membership::{ConnectionInfo, Membership};
use crate::models::{ConnectionId, Endpoint, LivenessState, PushOutcome, TransportKind};
use crate::telemetry;

/// Frame queued for a session's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
}

/// Receiving half of a registered session, owned by its transport task
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<OutboundFrame>,
}

struct Session {
    sender: Option<mpsc::Sender<OutboundFrame>>,
    last_seen: Instant,
}

#[derive(Default)]
struct HubState {
    membership: Arc<Membership>,
    sessions: HashMap<ConnectionId, Session>,
}

impl HubState {
    /// Copy-on-write access to the published membership
    fn membership_mut(&mut self) -> &mut Membership {
        let membership = Arc::make_mut(&mut self.membership);
        membership.bump();
        membership
    }
}

/// Process-wide registry of live transport sessions
///
/// Writers serialize on an async `RwLock`; readers take an `Arc` snapshot and
/// release the lock immediately.
pub struct ConnectionHub {
    state: RwLock<HubState>,
    config: HubConfig,
    events: EventBus,
}

impl ConnectionHub {
    pub fn new(config: HubConfig, events: EventBus) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            config,
            events,
        }
    }

    /// Register a new session. The returned handle yields frames to write.
    #[instrument(skip(self, id), fields(connection_id))]
    pub async fn register(
        &self,
        id: impl Into<ConnectionId>,
        endpoint_ref: Option<String>,
        transport: TransportKind,
    ) -> Result<ConnectionHandle, HubError> {
        let id: ConnectionId = id.into();
        tracing::Span::current().record("connection_id", id.as_str());
        let (sender, receiver) = mpsc::channel(self.config.outbound_buffer.max(1));

        let count = {
            let mut state = self.state.write().await;
            if state.sessions.contains_key(&id) {
                return Err(HubError::DuplicateConnection(id));
            }

            let membership = state.membership_mut();
            membership.insert_connection(ConnectionInfo {
                id: id.clone(),
                endpoint: None,
                transport,
                state: LivenessState::Open,
                opened_at: Utc::now(),
            });
            if let Some(external_id) = endpoint_ref.as_deref() {
                membership.associate(&id, external_id);
            }

            state.sessions.insert(
                id.clone(),
                Session {
                    sender: Some(sender),
                    last_seen: Instant::now(),
                },
            );
            state.sessions.len()
        };

        telemetry::update_connections(count);
        info!(connections = count, "Connection registered");
        self.events.publish(CoreEvent::ConnectionOpened {
            connection_id: id.clone(),
        });

        Ok(ConnectionHandle { id, receiver })
    }

    /// Remove a session. Unknown ids and repeated calls are no-ops.
    #[instrument(skip(self))]
    pub async fn unregister(&self, id: &str) {
        let count = {
            let mut state = self.state.write().await;
            if state.sessions.remove(id).is_none() {
                return;
            }
            state.membership_mut().remove_connection(id);
            state.sessions.len()
        };

        telemetry::update_connections(count);
        info!(connections = count, "Connection unregistered");
        self.events.publish(CoreEvent::ConnectionClosed {
            connection_id: id.to_string(),
        });
    }

    /// Move a session to `closing` and drop its outbound queue so the
    /// writer drains and ends
    #[instrument(skip(self))]
    pub async fn close(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(id) else {
            return false;
        };
        session.sender = None;
        state.membership_mut().set_state(id, LivenessState::Closing);
        debug!("Connection moved to closing");
        true
    }

    /// Enqueue a frame for a session, bounded by the write timeout
    pub async fn push(&self, id: &str, frame: OutboundFrame) -> PushOutcome {
        let sender = {
            let state = self.state.read().await;
            state.sessions.get(id).map(|session| session.sender.clone())
        };

        let sender = match sender {
            None => return self.report(id, PushOutcome::NotFound),
            Some(None) => {
                return self.report(id, PushOutcome::TransportError("session closing".to_string()))
            }
            Some(Some(sender)) => sender,
        };

        let outcome = match timeout(self.config.write_timeout(), sender.send(frame)).await {
            Ok(Ok(())) => PushOutcome::Delivered,
            Ok(Err(_)) => {
                // Writer is gone; the session will not recover
                self.unregister(id).await;
                PushOutcome::TransportError("session closed".to_string())
            }
            Err(_) => {
                warn!(connection_id = id, "Write timeout, closing session");
                self.close(id).await;
                PushOutcome::TransportError("write timeout".to_string())
            }
        };

        self.report(id, outcome)
    }

    /// Convenience wrapper for text frames
    pub async fn push_text(&self, id: &str, text: impl Into<String>) -> PushOutcome {
        self.push(id, OutboundFrame::Text(text.into())).await
    }

    fn report(&self, id: &str, outcome: PushOutcome) -> PushOutcome {
        telemetry::record_push(&outcome);
        debug!(connection_id = id, outcome = outcome.label(), "Push finished");
        self.events.publish(CoreEvent::Push {
            connection_id: id.to_string(),
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Associate a session with the endpoint whose external id is `user_id`
    #[instrument(skip(self))]
    pub async fn associate(&self, id: &str, user_id: &str) -> Result<(), HubError> {
        {
            let mut state = self.state.write().await;
            match state.membership.liveness(id) {
                LivenessState::Open => {}
                LivenessState::Closing => return Err(HubError::SessionClosed(id.to_string())),
                LivenessState::Closed => return Err(HubError::ConnectionNotFound(id.to_string())),
            }
            state.membership_mut().associate(id, user_id);
        }

        info!("Connection associated with endpoint");
        self.events.publish(CoreEvent::Associated {
            connection_id: id.to_string(),
            external_id: user_id.to_string(),
        });
        Ok(())
    }

    /// Record inbound activity for a session
    pub async fn touch(&self, id: &str) {
        if let Some(session) = self.state.write().await.sessions.get_mut(id) {
            session.last_seen = Instant::now();
        }
    }

    pub async fn last_seen(&self, id: &str) -> Option<Instant> {
        self.state.read().await.sessions.get(id).map(|s| s.last_seen)
    }

    pub async fn liveness(&self, id: &str) -> LivenessState {
        self.state.read().await.membership.liveness(id)
    }

    /// Consistent point-in-time view for address resolution
    pub async fn snapshot(&self) -> Arc<Membership> {
        self.state.read().await.membership.clone()
    }

    pub async fn upsert_endpoint(&self, endpoint: Endpoint) {
        debug!(external_id = %endpoint.external_id, "Upserting endpoint");
        self.state
            .write()
            .await
            .membership_mut()
            .upsert_endpoint(endpoint);
    }

    pub async fn remove_endpoint(&self, external_id: &str) -> Option<Endpoint> {
        self.state
            .write()
            .await
            .membership_mut()
            .remove_endpoint(external_id)
    }

    pub async fn endpoint_count(&self) -> usize {
        self.state.read().await.membership.endpoint_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}
