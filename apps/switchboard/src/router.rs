use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::protocol::{agent_key, session_key, InboundEvent, JoinRequest, OutboundEvent};
use crate::registry::{ConnectionId, Departure, RegistryStats, SessionRegistry};

/// Outbound side of the transport.
pub trait Emitter: Send + Sync {
    /// Queue `event` for `connection`. Returns `false` when the connection is
    /// no longer reachable. Must not block.
    fn emit(&self, connection: ConnectionId, event: OutboundEvent) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MissingRoutingKey,
    AlreadyBound,
    AgentNotFound,
    ControllerNotFound,
    ConnectionClosed,
}

impl DropReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DropReason::MissingRoutingKey => "missing_routing_key",
            DropReason::AlreadyBound => "already_bound",
            DropReason::AgentNotFound => "agent_not_found",
            DropReason::ControllerNotFound => "controller_not_found",
            DropReason::ConnectionClosed => "connection_closed",
        }
    }
}

impl From<&RegistryError> for DropReason {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::MissingSessionId | RegistryError::MissingAgentId => {
                DropReason::MissingRoutingKey
            }
            RegistryError::ConnectionAlreadyBound { .. } => DropReason::AlreadyBound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Processed; `emitted` events were handed to the transport
    Handled { emitted: usize },
    /// Agent arrival parked until a controller joins
    Queued,
    Dropped(DropReason),
}

/// Applies inbound events to the session registry and fans out the resulting
/// notifications and relays.
///
/// The registry lock is held across emission. `Emitter::emit` never blocks,
/// and holding the lock keeps each controller's notification order identical
/// to the order in which the registry applied the joins.
pub struct EventRouter {
    registry: Mutex<SessionRegistry>,
    emitter: Arc<dyn Emitter>,
}

impl EventRouter {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            registry: Mutex::new(SessionRegistry::new()),
            emitter,
        }
    }

    pub fn dispatch(&self, connection: ConnectionId, event: InboundEvent) -> RouteOutcome {
        let name = event.name();
        counter!("switchboard_events_total", 1, "event" => name);

        let outcome = match event {
            InboundEvent::ControllerJoin(JoinRequest { session_id, .. }) => {
                self.controller_join(connection, session_id.as_deref())
            }
            InboundEvent::AgentJoin(JoinRequest {
                session_id,
                agent_id,
            }) => self.agent_join(connection, session_id.as_deref(), agent_id.as_deref()),
            InboundEvent::ControllerToAgent(payload) => self.controller_to_agent(payload),
            InboundEvent::AgentToController(payload) => self.agent_to_controller(payload),
        };

        if let RouteOutcome::Dropped(reason) = outcome {
            counter!(
                "switchboard_dropped_total",
                1,
                "event" => name,
                "reason" => reason.metric_label()
            );
        }
        outcome
    }

    pub fn controller_join(
        &self,
        connection: ConnectionId,
        session_id: Option<&str>,
    ) -> RouteOutcome {
        let session_id = session_id.unwrap_or_default();
        let mut registry = self.registry.lock();
        let registration = match registry.register_controller(session_id, connection) {
            Ok(registration) => registration,
            Err(err) => return rejected(connection, "controller-join", &err),
        };

        if let Some(previous) = registration.replaced {
            info!(
                session_id,
                connection_id = %connection,
                replaced = %previous,
                "controller replaced"
            );
        }
        info!(
            session_id,
            connection_id = %connection,
            pending = registration.pending.len(),
            "controller joined"
        );

        let mut emitted = 0;
        for agent_id in registration.pending {
            if self.send(connection, OutboundEvent::AgentJoined { agent_id }) {
                emitted += 1;
            }
        }
        RouteOutcome::Handled { emitted }
    }

    pub fn agent_join(
        &self,
        connection: ConnectionId,
        session_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> RouteOutcome {
        let session_id = session_id.unwrap_or_default();
        let agent_id = agent_id.unwrap_or_default();
        let mut registry = self.registry.lock();
        let registration = match registry.register_agent(session_id, agent_id, connection) {
            Ok(registration) => registration,
            Err(err) => return rejected(connection, "agent-join", &err),
        };

        if let Some(previous) = registration.replaced {
            info!(
                session_id,
                agent_id,
                connection_id = %connection,
                replaced = %previous,
                "agent replaced"
            );
        }
        info!(
            session_id,
            agent_id,
            connection_id = %connection,
            "agent joined"
        );

        match registration.controller {
            Some(controller) => {
                let event = OutboundEvent::AgentJoined {
                    agent_id: agent_id.to_string(),
                };
                if self.send(controller, event) {
                    RouteOutcome::Handled { emitted: 1 }
                } else {
                    RouteOutcome::Dropped(DropReason::ConnectionClosed)
                }
            }
            None => {
                debug!(session_id, agent_id, "no controller yet; arrival queued");
                RouteOutcome::Queued
            }
        }
    }

    pub fn controller_to_agent(&self, payload: Value) -> RouteOutcome {
        let (Some(session_id), Some(agent_id)) = (
            session_key(&payload).map(str::to_owned),
            agent_key(&payload).map(str::to_owned),
        ) else {
            debug!("controller-to-agent without sessionId/agentId dropped");
            return RouteOutcome::Dropped(DropReason::MissingRoutingKey);
        };

        let registry = self.registry.lock();
        let Some(target) = registry.agent_connection(&session_id, &agent_id) else {
            warn!(
                session_id = %session_id,
                agent_id = %agent_id,
                "agent not found; command dropped"
            );
            return RouteOutcome::Dropped(DropReason::AgentNotFound);
        };

        if self.send(target, OutboundEvent::Command(payload)) {
            RouteOutcome::Handled { emitted: 1 }
        } else {
            RouteOutcome::Dropped(DropReason::ConnectionClosed)
        }
    }

    pub fn agent_to_controller(&self, payload: Value) -> RouteOutcome {
        let Some(session_id) = session_key(&payload).map(str::to_owned) else {
            debug!("agent-to-controller without sessionId dropped");
            return RouteOutcome::Dropped(DropReason::MissingRoutingKey);
        };

        let registry = self.registry.lock();
        let Some(controller) = registry.controller_connection(&session_id) else {
            warn!(session_id = %session_id, "controller not found; response dropped");
            return RouteOutcome::Dropped(DropReason::ControllerNotFound);
        };

        if self.send(controller, OutboundEvent::Response(payload)) {
            RouteOutcome::Handled { emitted: 1 }
        } else {
            RouteOutcome::Dropped(DropReason::ConnectionClosed)
        }
    }

    /// Called once per closed connection by the transport.
    pub fn disconnect(&self, connection: ConnectionId) -> RouteOutcome {
        let mut registry = self.registry.lock();
        match registry.remove_connection(connection) {
            None => {
                debug!(connection_id = %connection, "unbound connection closed");
                RouteOutcome::Handled { emitted: 0 }
            }
            // Agents are not told that their controller went away.
            Some(Departure::ControllerLeft { session_id }) => {
                info!(session_id = %session_id, connection_id = %connection, "controller left");
                RouteOutcome::Handled { emitted: 0 }
            }
            Some(Departure::AgentLeft {
                session_id,
                agent_id,
            }) => {
                info!(
                    session_id = %session_id,
                    agent_id = %agent_id,
                    connection_id = %connection,
                    "agent left"
                );
                let Some(controller) = registry.controller_connection(&session_id) else {
                    return RouteOutcome::Handled { emitted: 0 };
                };
                let delivered = self.send(controller, OutboundEvent::AgentLeft { agent_id });
                RouteOutcome::Handled {
                    emitted: usize::from(delivered),
                }
            }
        }
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }

    fn send(&self, connection: ConnectionId, event: OutboundEvent) -> bool {
        let name = event.name();
        let delivered = self.emitter.emit(connection, event);
        if !delivered {
            warn!(connection_id = %connection, event = name, "connection gone; emission dropped");
        }
        delivered
    }
}

fn rejected(connection: ConnectionId, event: &'static str, err: &RegistryError) -> RouteOutcome {
    debug!(
        connection_id = %connection,
        event,
        reason = err.metric_label(),
        "join rejected: {}",
        err
    );
    RouteOutcome::Dropped(DropReason::from(err))
}
