use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Events received from a connected endpoint.
///
/// Every frame is a JSON object of the form `{"event": "...", "data": {...}}`.
/// Join payloads are decoded leniently: a missing or non-string routing field
/// comes through as `None` so the router can drop the request quietly.
///
/// The `admin-*`/`victim-*` names and the `victimId` field are accepted on
/// input only. Outbound events always use the `agent-*` names and `agentId`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    /// Bind the sending connection as the controller of a session
    #[serde(alias = "admin-join")]
    ControllerJoin(JoinRequest),
    /// Bind the sending connection as an agent of a session
    #[serde(alias = "victim-join")]
    AgentJoin(JoinRequest),
    /// Opaque command relayed to one agent as `command`
    #[serde(alias = "admin-to-victim")]
    ControllerToAgent(Value),
    /// Opaque reply relayed to the session controller as `response`
    #[serde(alias = "victim-to-admin")]
    AgentToController(Value),
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::ControllerJoin(_) => "controller-join",
            InboundEvent::AgentJoin(_) => "agent-join",
            InboundEvent::ControllerToAgent(_) => "controller-to-agent",
            InboundEvent::AgentToController(_) => "agent-to-controller",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JoinRequest {
    #[serde(default, rename = "sessionId", deserialize_with = "lenient_string")]
    pub session_id: Option<String>,
    #[serde(
        default,
        rename = "agentId",
        alias = "victimId",
        deserialize_with = "lenient_string"
    )]
    pub agent_id: Option<String>,
}

/// Events pushed to a specific connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    AgentJoined {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    AgentLeft {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    /// Verbatim `controller-to-agent` payload
    Command(Value),
    /// Verbatim `agent-to-controller` payload
    Response(Value),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::AgentJoined { .. } => "agent-joined",
            OutboundEvent::AgentLeft { .. } => "agent-left",
            OutboundEvent::Command(_) => "command",
            OutboundEvent::Response(_) => "response",
        }
    }
}

pub fn decode_frame(text: &str) -> Result<InboundEvent, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn encode_frame(event: &OutboundEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Routing key carried by an opaque relay payload.
pub fn session_key(payload: &Value) -> Option<&str> {
    non_empty_str(payload, "sessionId")
}

pub fn agent_key(payload: &Value) -> Option<&str> {
    non_empty_str(payload, "agentId").or_else(|| non_empty_str(payload, "victimId"))
}

fn non_empty_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    })
}
