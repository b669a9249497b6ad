use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A chat message scoped to a room. Immutable once constructed; the serde
/// form is also the on-disk JSONL log line (`ts` RFC-3339, `meta` object).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub room: String,
    pub sender: String,
    pub content: String,
    pub role: ChatRole,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "meta", default)]
    pub meta: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for ChatRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown chat role: {other}")),
        }
    }
}

impl Message {
    pub fn new(
        room: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        role: ChatRole,
    ) -> Self {
        Self {
            room: room.into(),
            sender: sender.into(),
            content: content.into(),
            role,
            timestamp: Utc::now(),
            meta: Map::new(),
        }
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    pub fn user(room: impl Into<String>, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(room, sender, content, ChatRole::User)
    }
}
