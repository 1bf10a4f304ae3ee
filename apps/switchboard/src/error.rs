use thiserror::Error;

use crate::registry::{Binding, ConnectionId};

/// Reasons the registry refuses a join. Every variant is a no-op for the
/// registry state; callers log and drop the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("join request is missing a sessionId")]
    MissingSessionId,

    #[error("agent join request is missing an agentId")]
    MissingAgentId,

    #[error("connection {connection} is already bound as {existing}")]
    ConnectionAlreadyBound {
        connection: ConnectionId,
        existing: Binding,
    },
}

impl RegistryError {
    /// Label used for log fields and drop counters.
    pub fn metric_label(&self) -> &'static str {
        match self {
            RegistryError::MissingSessionId => "missing_session_id",
            RegistryError::MissingAgentId => "missing_agent_id",
            RegistryError::ConnectionAlreadyBound { .. } => "connection_already_bound",
        }
    }
}
