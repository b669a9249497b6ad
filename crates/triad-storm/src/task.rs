use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use triad_core::ids::{TaskId, WorkerId};

use crate::protocol::TaskOffer;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are final; no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Submission parameters for a distributed task.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub task_type: String,
    pub description: String,
    pub payload: Value,
    pub required_capabilities: Vec<String>,
    pub priority: i32,
    pub timeout_seconds: u64,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            payload: Value::Object(Map::new()),
            required_capabilities: Vec::new(),
            priority: 1,
            timeout_seconds: 300,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }
}

/// A distributed work item. Mutated only by the coordinator; terminal states
/// are final.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    pub payload: Value,
    pub required_capabilities: Vec<String>,
    pub priority: i32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<WorkerId>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskDefinition {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            task_type: spec.task_type,
            description: spec.description,
            payload: spec.payload,
            required_capabilities: spec.required_capabilities,
            priority: spec.priority,
            timeout_seconds: spec.timeout_seconds,
            created_at: Utc::now(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Whether the task's age exceeds its timeout at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at).num_seconds() > self.timeout_seconds as i64
    }

    /// The fields shipped to the assigned worker.
    pub fn offer(&self) -> TaskOffer {
        TaskOffer {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            description: self.description.clone(),
            payload: self.payload.clone(),
            timeout_seconds: self.timeout_seconds,
        }
    }
}
