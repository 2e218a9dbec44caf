// Address expression parsing and resolution
//
// Resolution is a pure function of a membership snapshot: it never mutates
// and never fails. Anything that does not resolve contributes nothing.

use std::collections::BTreeSet;

use crate::hub::Membership;
use crate::models::{ConnectionId, Realm};

const EXTERNAL_ID_PREFIX: &str = "exid:";
const TAG_PREFIX: &str = "etag:";

/// A parsed address expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressExpression<'a> {
    /// Connection id, also used for unknown prefixes
    Literal(&'a str),
    /// All connections of the endpoint with this external id
    ExternalId(&'a str),
    /// All connections of every endpoint carrying this tag
    Tag(&'a str),
    /// All connections of the endpoint with this oid
    Oid(&'a str),
}

impl<'a> AddressExpression<'a> {
    /// Parse an expression. A leading `#` is decoration only. Blank
    /// expressions select nothing.
    pub fn parse(raw: &'a str) -> Option<Self> {
        let expr = raw.trim();
        let expr = expr.strip_prefix('#').unwrap_or(expr).trim_start();
        if expr.is_empty() {
            return None;
        }

        if let Some(external_id) = expr.strip_prefix(EXTERNAL_ID_PREFIX) {
            Some(AddressExpression::ExternalId(external_id))
        } else if let Some(tag) = expr.strip_prefix(TAG_PREFIX) {
            Some(AddressExpression::Tag(tag))
        } else {
            Some(AddressExpression::Literal(expr))
        }
    }

    /// Open connections selected by this expression
    pub fn resolve_into(&self, snapshot: &Membership, out: &mut BTreeSet<ConnectionId>) {
        match self {
            AddressExpression::Literal(id) => {
                if snapshot.is_open(id) {
                    out.insert((*id).to_string());
                }
            }
            AddressExpression::ExternalId(external_id) => {
                if let Some(endpoint) = snapshot.endpoint(external_id) {
                    out.extend(snapshot.open_connections_of(endpoint));
                }
            }
            AddressExpression::Tag(tag) => {
                for endpoint in snapshot.endpoints_with_tag(tag) {
                    out.extend(snapshot.open_connections_of(endpoint));
                }
            }
            AddressExpression::Oid(oid) => {
                if let Some(endpoint) = snapshot.endpoint_by_oid(oid) {
                    out.extend(snapshot.open_connections_of(endpoint));
                }
            }
        }
    }
}

/// Resolve a set of expressions to the union of their open connections
pub fn resolve<S: AsRef<str>>(expressions: &[S], snapshot: &Membership) -> BTreeSet<ConnectionId> {
    let mut resolved = BTreeSet::new();
    for raw in expressions {
        if let Some(expr) = AddressExpression::parse(raw.as_ref()) {
            expr.resolve_into(snapshot, &mut resolved);
        }
    }
    resolved
}

/// Resolve every addressing field of a realm: expressions, user ids
/// (as external ids) and endpoint oids
pub fn resolve_realm(realm: &Realm, snapshot: &Membership) -> BTreeSet<ConnectionId> {
    let mut resolved = resolve(&realm.connections, snapshot);
    for user in &realm.users {
        AddressExpression::ExternalId(user.trim()).resolve_into(snapshot, &mut resolved);
    }
    for oid in &realm.endpoints {
        AddressExpression::Oid(oid.trim()).resolve_into(snapshot, &mut resolved);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ConnectionInfo;
    use crate::models::{Endpoint, LivenessState, TransportKind};
    use chrono::Utc;

    fn snapshot() -> Membership {
        let mut m = Membership::new();
        for id in ["conn-1", "conn-2", "conn-3", "conn-4"] {
            m.insert_connection(ConnectionInfo {
                id: id.to_string(),
                endpoint: None,
                transport: TransportKind::Websocket,
                state: LivenessState::Open,
                opened_at: Utc::now(),
            });
        }
        m.upsert_endpoint(
            Endpoint::new("studio:1")
                .with_tags(["Admin"])
                .with_websockets(["conn-1"]),
        );
        m.upsert_endpoint(
            Endpoint::new("studio:2")
                .with_tags(["Admin", "Ops"])
                .with_websockets(["conn-1", "conn-2"]),
        );
        m.upsert_endpoint(Endpoint::new("studio:3").with_websockets(["conn-gone"]));
        m
    }

    fn ids(set: BTreeSet<ConnectionId>) -> Vec<String> {
        set.into_iter().collect()
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            AddressExpression::parse("exid:studio:1"),
            Some(AddressExpression::ExternalId("studio:1"))
        );
        assert_eq!(
            AddressExpression::parse("#etag:Admin"),
            Some(AddressExpression::Tag("Admin"))
        );
        assert_eq!(
            AddressExpression::parse("mailto:x"),
            Some(AddressExpression::Literal("mailto:x"))
        );
        assert_eq!(AddressExpression::parse("  "), None);
        assert_eq!(AddressExpression::parse("#"), None);
    }

    #[test]
    fn test_resolve_external_id() {
        let m = snapshot();
        assert_eq!(ids(resolve(&["exid:studio:1"], &m)), vec!["conn-1"]);
    }

    #[test]
    fn test_resolve_tag_deduplicates() {
        let m = snapshot();
        assert_eq!(ids(resolve(&["etag:Admin"], &m)), vec!["conn-1", "conn-2"]);
    }

    #[test]
    fn test_hash_is_decoration_only() {
        let m = snapshot();
        assert_eq!(resolve(&["#etag:Admin"], &m), resolve(&["etag:Admin"], &m));
        assert_eq!(resolve(&["#conn-3"], &m), resolve(&["conn-3"], &m));
    }

    #[test]
    fn test_unresolvable_is_empty() {
        let m = snapshot();
        assert!(resolve(&["exid:nobody", "etag:None", "conn-404", ""], &m).is_empty());
        // Endpoint exists but its only handle is not a live connection
        assert!(resolve(&["exid:studio:3"], &m).is_empty());
    }

    #[test]
    fn test_partial_match_is_union() {
        let m = snapshot();
        let resolved = resolve(&["exid:nobody", "conn-4", "etag:Ops"], &m);
        assert_eq!(ids(resolved), vec!["conn-1", "conn-2", "conn-4"]);
    }

    #[test]
    fn test_resolve_realm_users_and_oids() {
        let m = snapshot();
        let oid = m.endpoint("studio:2").unwrap().oid.clone();
        let realm = Realm {
            connections: vec![],
            users: vec!["studio:1".to_string()],
            endpoints: vec![oid],
            action: "noop".to_string(),
            payload: serde_json::Value::Null,
        };
        assert_eq!(ids(resolve_realm(&realm, &m)), vec!["conn-1", "conn-2"]);
    }
}
