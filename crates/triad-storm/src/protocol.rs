use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use triad_core::ids::{EnvelopeId, TaskId};

/// Sender name stamped on every coordinator-originated envelope.
pub const SERVICE_NAME: &str = "storm";

/// Closed set of wire message types. The dispatcher matches exhaustively so
/// a new variant cannot be forgotten.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    TaskRequest,
    TaskResponse,
    TaskUpdate,
    AgentRegistration,
    AgentHeartbeat,
    Coordination,
    Broadcast,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::TaskUpdate => "task_update",
            Self::AgentRegistration => "agent_registration",
            Self::AgentHeartbeat => "agent_heartbeat",
            Self::Coordination => "coordination",
            Self::Broadcast => "broadcast",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed, addressed wire envelope. Every frame on a coordinator connection
/// is one of these, serialized as JSON. `recipient` absent means broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StormMessage {
    pub id: EnvelopeId,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl StormMessage {
    pub fn new(kind: EnvelopeKind, sender: impl Into<String>) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind,
            sender: sender.into(),
            recipient: None,
            payload: Value::Object(Map::new()),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Decode the opaque payload into a typed payload struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Serialize a typed payload into the envelope's opaque `payload` field.
pub fn payload_of<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

// --- Typed payloads ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationPayload {
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub status: String,
    pub agent_id: String,
}

impl RegisteredPayload {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            status: "registered".into(),
            agent_id: agent_id.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub load_factor: f64,
}

/// The task fields shipped to a worker in a `task_request`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOffer {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub payload: Value,
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequestPayload {
    pub task: TaskOffer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResponsePayload {
    pub task_id: TaskId,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Cancel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskUpdatePayload {
    pub task_id: TaskId,
    pub action: UpdateAction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinationPayload {
    pub action: String,
    pub session_id: String,
    pub participating_agents: Vec<String>,
    pub coordination_goal: String,
    #[serde(default)]
    pub context: Value,
}

/// Reply sent back for malformed or out-of-order frames. The connection
/// stays open.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}
