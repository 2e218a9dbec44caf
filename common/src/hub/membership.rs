// Point-in-time view of connections and endpoints
//
// A `Membership` is immutable once published by the hub. Writers clone it on
// demand (`Arc::make_mut`) so readers holding a snapshot never observe a
// partial update.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::models::{ConnectionId, Endpoint, LivenessState, TransportKind};

/// Connection as seen by address resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// External id of the owning endpoint, if associated
    pub endpoint: Option<String>,
    pub transport: TransportKind,
    pub state: LivenessState,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn is_open(&self) -> bool {
        self.state == LivenessState::Open
    }
}

#[derive(Debug, Clone, Default)]
pub struct Membership {
    version: u64,
    connections: HashMap<ConnectionId, ConnectionInfo>,
    /// Keyed by external id
    endpoints: HashMap<String, Endpoint>,
    /// oid -> external id
    oids: HashMap<String, String>,
    /// tag -> external ids
    tags: HashMap<String, BTreeSet<String>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter bumped on every published change
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn connection(&self, id: &str) -> Option<&ConnectionInfo> {
        self.connections.get(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionInfo> {
        self.connections.values()
    }

    /// Liveness of `id`; connections no longer registered are closed
    pub fn liveness(&self, id: &str) -> LivenessState {
        self.connections
            .get(id)
            .map_or(LivenessState::Closed, |info| info.state)
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.connections.get(id).is_some_and(ConnectionInfo::is_open)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn endpoint(&self, external_id: &str) -> Option<&Endpoint> {
        self.endpoints.get(external_id)
    }

    pub fn endpoint_by_oid(&self, oid: &str) -> Option<&Endpoint> {
        self.oids
            .get(oid)
            .and_then(|external_id| self.endpoints.get(external_id))
    }

    /// Endpoints carrying `tag`, in external id order
    pub fn endpoints_with_tag<'a>(&'a self, tag: &str) -> impl Iterator<Item = &'a Endpoint> + 'a {
        self.tags
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(move |external_id| self.endpoints.get(external_id))
    }

    /// Open connections of an endpoint: its websocket handles plus any
    /// connection associated with it at registration or later
    pub fn open_connections_of(&self, endpoint: &Endpoint) -> BTreeSet<ConnectionId> {
        let handles = endpoint.websockets.iter().filter(|id| self.is_open(id)).cloned();
        let associated = self
            .connections
            .values()
            .filter(|c| c.is_open() && c.endpoint.as_deref() == Some(endpoint.external_id.as_str()))
            .map(|c| c.id.clone());
        handles.chain(associated).collect()
    }

    // ------------------------------------------------------------------
    // Mutation, reserved for the hub
    // ------------------------------------------------------------------

    pub(crate) fn bump(&mut self) {
        self.version += 1;
    }

    pub(crate) fn insert_connection(&mut self, info: ConnectionInfo) {
        self.connections.insert(info.id.clone(), info);
    }

    /// Drop a connection and scrub it from every endpoint's handles
    pub(crate) fn remove_connection(&mut self, id: &str) -> Option<ConnectionInfo> {
        let removed = self.connections.remove(id)?;
        for endpoint in self.endpoints.values_mut() {
            endpoint.websockets.retain(|handle| handle != id);
        }
        Some(removed)
    }

    pub(crate) fn set_state(&mut self, id: &str, state: LivenessState) -> bool {
        match self.connections.get_mut(id) {
            Some(info) => {
                info.state = state;
                true
            }
            None => false,
        }
    }

    /// Attach a connection to the endpoint with `external_id`, creating the
    /// endpoint when missing
    pub(crate) fn associate(&mut self, id: &str, external_id: &str) -> bool {
        let Some(info) = self.connections.get_mut(id) else {
            return false;
        };
        info.endpoint = Some(external_id.to_string());

        if !self.endpoints.contains_key(external_id) {
            self.upsert_endpoint(Endpoint::new(external_id));
        }
        if let Some(endpoint) = self.endpoints.get_mut(external_id) {
            if !endpoint.websockets.iter().any(|handle| handle == id) {
                endpoint.websockets.push(id.to_string());
            }
        }
        true
    }

    /// Insert or replace the endpoint keyed by its external id
    pub(crate) fn upsert_endpoint(&mut self, endpoint: Endpoint) {
        self.remove_endpoint(&endpoint.external_id);

        self.oids
            .insert(endpoint.oid.clone(), endpoint.external_id.clone());
        for tag in &endpoint.tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(endpoint.external_id.clone());
        }
        self.endpoints.insert(endpoint.external_id.clone(), endpoint);
    }

    pub(crate) fn remove_endpoint(&mut self, external_id: &str) -> Option<Endpoint> {
        let removed = self.endpoints.remove(external_id)?;
        self.oids.remove(&removed.oid);
        for tag in &removed.tags {
            if let Some(members) = self.tags.get_mut(tag) {
                members.remove(external_id);
                if members.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(id: &str, endpoint: Option<&str>) -> ConnectionInfo {
        ConnectionInfo {
            id: id.to_string(),
            endpoint: endpoint.map(str::to_string),
            transport: TransportKind::Websocket,
            state: LivenessState::Open,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_endpoint_reindexes_tags() {
        let mut m = Membership::new();
        m.upsert_endpoint(Endpoint::new("studio:1").with_tags(["Admin", "Ops"]));
        m.upsert_endpoint(Endpoint::new("studio:1").with_tags(["Ops"]));

        assert_eq!(m.endpoint_count(), 1);
        assert_eq!(m.endpoints_with_tag("Admin").count(), 0);
        assert_eq!(m.endpoints_with_tag("Ops").count(), 1);
    }

    #[test]
    fn test_associate_creates_endpoint() {
        let mut m = Membership::new();
        m.insert_connection(open("c1", None));
        assert!(m.associate("c1", "user-7"));

        let endpoint = m.endpoint("user-7").unwrap();
        assert!(endpoint.tags.is_empty());
        assert_eq!(endpoint.websockets, vec!["c1".to_string()]);
        assert!(!m.associate("missing", "user-7"));
    }

    #[test]
    fn test_remove_connection_scrubs_handles() {
        let mut m = Membership::new();
        m.upsert_endpoint(Endpoint::new("studio:1").with_websockets(["c1", "c2"]));
        m.insert_connection(open("c1", None));

        assert!(m.remove_connection("c1").is_some());
        assert_eq!(m.endpoint("studio:1").unwrap().websockets, vec!["c2".to_string()]);
        assert!(m.remove_connection("c1").is_none());
    }

    #[test]
    fn test_open_connections_skip_closing() {
        let mut m = Membership::new();
        let endpoint = Endpoint::new("studio:1").with_websockets(["c1", "c2", "ghost"]);
        m.upsert_endpoint(endpoint.clone());
        m.insert_connection(open("c1", None));
        m.insert_connection(open("c2", None));
        m.insert_connection(open("c3", Some("studio:1")));
        m.set_state("c2", LivenessState::Closing);

        let ids: Vec<_> = m.open_connections_of(&endpoint).into_iter().collect();
        assert_eq!(ids, vec!["c1".to_string(), "c3".to_string()]);
    }

    #[test]
    fn test_endpoint_by_oid() {
        let mut m = Membership::new();
        let endpoint = Endpoint::new("studio:2");
        let oid = endpoint.oid.clone();
        m.upsert_endpoint(endpoint);
        assert_eq!(m.endpoint_by_oid(&oid).unwrap().external_id, "studio:2");
        m.remove_endpoint("studio:2");
        assert!(m.endpoint_by_oid(&oid).is_none());
    }
}
