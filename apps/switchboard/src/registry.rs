use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::error::RegistryError;

/// Opaque identifier the transport allocates for each connected endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The single identity a connection holds within the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Controller { session_id: String },
    Agent { session_id: String, agent_id: String },
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Controller { session_id } => write!(f, "controller of {session_id}"),
            Binding::Agent {
                session_id,
                agent_id,
            } => write!(f, "agent {agent_id} of {session_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerRegistration {
    /// Agents that joined before any controller, oldest first
    pub pending: Vec<String>,
    /// Previous controller displaced by this join
    pub replaced: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistration {
    /// Controller to notify right away; `None` means the arrival was queued
    pub controller: Option<ConnectionId>,
    /// Previous connection that backed the same agent id
    pub replaced: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    ControllerLeft {
        session_id: String,
    },
    AgentLeft {
        session_id: String,
        agent_id: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub controllers: usize,
    pub agents: usize,
    pub pending: usize,
    pub connections: usize,
}

/// In-memory session state: controllers, agents and queued agent arrivals.
///
/// All mutation goes through these methods. A reverse index from connection to
/// binding keeps disconnect cleanup O(1) and lets the registry refuse a
/// connection that tries to take on a second identity.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    controllers: HashMap<String, ConnectionId>,
    agents: HashMap<String, HashMap<String, ConnectionId>>,
    pending: HashMap<String, Vec<String>>,
    bindings: HashMap<ConnectionId, Binding>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection` as the controller of `session_id`, replacing any
    /// previous controller, and hand back the queued arrivals to flush.
    pub fn register_controller(
        &mut self,
        session_id: &str,
        connection: ConnectionId,
    ) -> Result<ControllerRegistration, RegistryError> {
        if session_id.is_empty() {
            return Err(RegistryError::MissingSessionId);
        }
        let binding = Binding::Controller {
            session_id: session_id.to_string(),
        };
        self.ensure_unbound_or_same(connection, &binding)?;

        let replaced = self
            .controllers
            .insert(session_id.to_string(), connection)
            .filter(|previous| *previous != connection);
        if let Some(previous) = replaced {
            self.bindings.remove(&previous);
        }
        self.agents.entry(session_id.to_string()).or_default();
        self.bindings.insert(connection, binding);

        let pending = self.pending.remove(session_id).unwrap_or_default();
        Ok(ControllerRegistration { pending, replaced })
    }

    /// Bind `connection` as `agent_id` within `session_id`. Without a
    /// controller the arrival is appended to the session's pending queue.
    pub fn register_agent(
        &mut self,
        session_id: &str,
        agent_id: &str,
        connection: ConnectionId,
    ) -> Result<AgentRegistration, RegistryError> {
        if session_id.is_empty() {
            return Err(RegistryError::MissingSessionId);
        }
        if agent_id.is_empty() {
            return Err(RegistryError::MissingAgentId);
        }
        let binding = Binding::Agent {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
        };
        self.ensure_unbound_or_same(connection, &binding)?;

        let replaced = self
            .agents
            .entry(session_id.to_string())
            .or_default()
            .insert(agent_id.to_string(), connection)
            .filter(|previous| *previous != connection);
        if let Some(previous) = replaced {
            self.bindings.remove(&previous);
        }
        self.bindings.insert(connection, binding);

        let controller = self.controllers.get(session_id).copied();
        if controller.is_none() {
            self.pending
                .entry(session_id.to_string())
                .or_default()
                .push(agent_id.to_string());
        }
        Ok(AgentRegistration {
            controller,
            replaced,
        })
    }

    pub fn agent_connection(&self, session_id: &str, agent_id: &str) -> Option<ConnectionId> {
        self.agents.get(session_id)?.get(agent_id).copied()
    }

    pub fn controller_connection(&self, session_id: &str) -> Option<ConnectionId> {
        self.controllers.get(session_id).copied()
    }

    pub fn binding(&self, connection: ConnectionId) -> Option<&Binding> {
        self.bindings.get(&connection)
    }

    pub fn pending_arrivals(&self, session_id: &str) -> &[String] {
        self.pending
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Drop whatever `connection` was bound as. Returns `None` when it held no
    /// binding (never joined, or was displaced by a newer connection).
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Option<Departure> {
        match self.bindings.remove(&connection)? {
            Binding::Controller { session_id } => {
                if self.controllers.get(&session_id) == Some(&connection) {
                    self.controllers.remove(&session_id);
                }
                self.pending.remove(&session_id);
                self.prune_agents(&session_id);
                Some(Departure::ControllerLeft { session_id })
            }
            Binding::Agent {
                session_id,
                agent_id,
            } => {
                if let Some(agents) = self.agents.get_mut(&session_id) {
                    if agents.get(&agent_id) == Some(&connection) {
                        agents.remove(&agent_id);
                    }
                }
                self.prune_agents(&session_id);
                Some(Departure::AgentLeft {
                    session_id,
                    agent_id,
                })
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions: HashSet<&String> = self
            .controllers
            .keys()
            .chain(self.agents.keys())
            .chain(self.pending.keys())
            .collect();
        RegistryStats {
            sessions: sessions.len(),
            controllers: self.controllers.len(),
            agents: self.agents.values().map(HashMap::len).sum(),
            pending: self.pending.values().map(Vec::len).sum(),
            connections: self.bindings.len(),
        }
    }

    fn ensure_unbound_or_same(
        &self,
        connection: ConnectionId,
        binding: &Binding,
    ) -> Result<(), RegistryError> {
        match self.bindings.get(&connection) {
            Some(existing) if existing != binding => Err(RegistryError::ConnectionAlreadyBound {
                connection,
                existing: existing.clone(),
            }),
            _ => Ok(()),
        }
    }

    // Empty agent maps are only kept while a controller holds the session.
    fn prune_agents(&mut self, session_id: &str) {
        let empty = self
            .agents
            .get(session_id)
            .is_some_and(HashMap::is_empty);
        if empty && !self.controllers.contains_key(session_id) {
            self.agents.remove(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn last_controller_join_wins() {
        let mut registry = SessionRegistry::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();

        registry.register_controller("s1", first).unwrap();
        let registration = registry.register_controller("s1", second).unwrap();

        assert_eq!(registration.replaced, Some(first));
        assert_eq!(registry.controller_connection("s1"), Some(second));
        assert!(registry.binding(first).is_none());
        // The displaced controller no longer owns anything.
        assert_eq!(registry.remove_connection(first), None);
        assert_eq!(registry.controller_connection("s1"), Some(second));
    }

    #[test_timeout::timeout]
    fn pending_arrivals_flush_in_order_and_clear() {
        let mut registry = SessionRegistry::new();
        let a = registry
            .register_agent("s1", "a", ConnectionId::new())
            .unwrap();
        let b = registry
            .register_agent("s1", "b", ConnectionId::new())
            .unwrap();
        assert_eq!(a.controller, None);
        assert_eq!(b.controller, None);
        assert_eq!(registry.pending_arrivals("s1"), ["a", "b"]);

        let registration = registry
            .register_controller("s1", ConnectionId::new())
            .unwrap();
        assert_eq!(registration.pending, vec!["a", "b"]);
        assert!(registry.pending_arrivals("s1").is_empty());
    }

    #[test_timeout::timeout]
    fn agent_join_with_controller_present_is_not_queued() {
        let mut registry = SessionRegistry::new();
        let controller = ConnectionId::new();
        registry.register_controller("s1", controller).unwrap();

        let registration = registry
            .register_agent("s1", "v1", ConnectionId::new())
            .unwrap();
        assert_eq!(registration.controller, Some(controller));
        assert!(registry.pending_arrivals("s1").is_empty());
    }

    #[test_timeout::timeout]
    fn rejoining_while_pending_appends_again() {
        let mut registry = SessionRegistry::new();
        let agent = ConnectionId::new();
        registry.register_agent("s1", "a", agent).unwrap();
        registry.register_agent("s1", "a", agent).unwrap();
        assert_eq!(registry.pending_arrivals("s1"), ["a", "a"]);
    }

    #[test_timeout::timeout]
    fn flushed_arrivals_are_not_replayed_to_next_controller() {
        let mut registry = SessionRegistry::new();
        registry
            .register_agent("s1", "x", ConnectionId::new())
            .unwrap();
        let controller = ConnectionId::new();
        let registration = registry.register_controller("s1", controller).unwrap();
        assert_eq!(registration.pending, vec!["x"]);

        let departure = registry.remove_connection(controller);
        assert_eq!(
            departure,
            Some(Departure::ControllerLeft {
                session_id: "s1".into(),
            })
        );

        let registration = registry
            .register_controller("s1", ConnectionId::new())
            .unwrap();
        assert!(registration.pending.is_empty());
    }

    #[test_timeout::timeout]
    fn agent_reconnect_overwrites_binding() {
        let mut registry = SessionRegistry::new();
        let old = ConnectionId::new();
        let new = ConnectionId::new();
        registry.register_agent("s1", "v1", old).unwrap();
        let registration = registry.register_agent("s1", "v1", new).unwrap();

        assert_eq!(registration.replaced, Some(old));
        assert_eq!(registry.agent_connection("s1", "v1"), Some(new));
        assert_eq!(registry.remove_connection(old), None);
        assert_eq!(registry.agent_connection("s1", "v1"), Some(new));
    }

    #[test_timeout::timeout]
    fn agent_disconnect_reports_identity() {
        let mut registry = SessionRegistry::new();
        let agent = ConnectionId::new();
        registry.register_agent("s1", "v1", agent).unwrap();

        assert_eq!(
            registry.remove_connection(agent),
            Some(Departure::AgentLeft {
                session_id: "s1".into(),
                agent_id: "v1".into(),
            })
        );
        assert_eq!(registry.agent_connection("s1", "v1"), None);
        assert_eq!(registry.remove_connection(agent), None);
    }

    #[test_timeout::timeout]
    fn lookups_miss_for_unknown_session_or_agent() {
        let mut registry = SessionRegistry::new();
        registry
            .register_agent("s1", "v1", ConnectionId::new())
            .unwrap();
        assert_eq!(registry.agent_connection("s2", "v1"), None);
        assert_eq!(registry.agent_connection("s1", "v2"), None);
        assert_eq!(registry.controller_connection("s1"), None);
    }

    #[test_timeout::timeout]
    fn empty_routing_fields_are_rejected_without_side_effects() {
        let mut registry = SessionRegistry::new();
        let connection = ConnectionId::new();
        assert_eq!(
            registry.register_controller("", connection),
            Err(RegistryError::MissingSessionId)
        );
        assert_eq!(
            registry.register_agent("s1", "", connection),
            Err(RegistryError::MissingAgentId)
        );
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test_timeout::timeout]
    fn connection_cannot_take_a_second_identity() {
        let mut registry = SessionRegistry::new();
        let connection = ConnectionId::new();
        registry.register_agent("s1", "v1", connection).unwrap();

        let err = registry
            .register_agent("s1", "v2", connection)
            .unwrap_err();
        assert_eq!(err.metric_label(), "connection_already_bound");
        let err = registry.register_controller("s1", connection).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ConnectionAlreadyBound { existing: Binding::Agent { .. }, .. }
        ));
        assert_eq!(registry.agent_connection("s1", "v2"), None);
        assert_eq!(registry.controller_connection("s1"), None);
    }

    #[test_timeout::timeout]
    fn controller_rejoin_from_same_connection_is_idempotent() {
        let mut registry = SessionRegistry::new();
        let controller = ConnectionId::new();
        registry.register_controller("s1", controller).unwrap();
        let registration = registry.register_controller("s1", controller).unwrap();
        assert_eq!(registration.replaced, None);
        assert_eq!(registry.stats().connections, 1);
    }

    #[test_timeout::timeout]
    fn stats_track_sessions_across_maps() {
        let mut registry = SessionRegistry::new();
        let controller = ConnectionId::new();
        registry.register_controller("s1", controller).unwrap();
        registry
            .register_agent("s1", "v1", ConnectionId::new())
            .unwrap();
        registry
            .register_agent("s2", "v2", ConnectionId::new())
            .unwrap();

        assert_eq!(
            registry.stats(),
            RegistryStats {
                sessions: 2,
                controllers: 1,
                agents: 2,
                pending: 1,
                connections: 3,
            }
        );

        registry.remove_connection(controller);
        let stats = registry.stats();
        assert_eq!(stats.controllers, 0);
        assert_eq!(stats.connections, 2);
    }
}
