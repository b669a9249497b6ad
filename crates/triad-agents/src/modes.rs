use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Per-room behavioral mode. Exactly one current mode per room; the only
/// transition is an explicit `set_mode` (no automatic transitions, no
/// history).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomMode {
    #[default]
    Safe,
    Anon,
    Triad,
}

impl RoomMode {
    /// Derived read-only flags other agents consult to adjust behavior.
    pub fn flags(self) -> ModeFlags {
        ModeFlags {
            cautious_execution: self == Self::Safe,
            redact_pii: self == Self::Anon,
            fast_cadence: self == Self::Triad,
        }
    }
}

impl std::fmt::Display for RoomMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Anon => write!(f, "anon"),
            Self::Triad => write!(f, "triad"),
        }
    }
}

impl std::str::FromStr for RoomMode {
    type Err = ModeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "anon" => Ok(Self::Anon),
            "triad" => Ok(Self::Triad),
            other => Err(ModeError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct ModeFlags {
    pub cautious_execution: bool,
    pub redact_pii: bool,
    pub fast_cadence: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("invalid mode: {0}")]
    InvalidMode(String),
}

/// Room-name -> mode map, defaulting to `safe` for unseen rooms. The
/// registry never inspects message content.
pub struct ModeRegistry {
    per_room: RwLock<HashMap<String, RoomMode>>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self {
            per_room: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self, room: &str) -> RoomMode {
        self.per_room.read().get(room).copied().unwrap_or_default()
    }

    /// Parse and set a room's mode, rejecting unknown names.
    pub fn set_mode(&self, room: &str, mode: &str) -> Result<RoomMode, ModeError> {
        let mode: RoomMode = mode.parse()?;
        self.set(room, mode);
        Ok(mode)
    }

    pub fn set(&self, room: &str, mode: RoomMode) {
        self.per_room.write().insert(room.to_string(), mode);
    }

    pub fn flags(&self, room: &str) -> ModeFlags {
        self.mode(room).flags()
    }
}

impl Default for ModeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
