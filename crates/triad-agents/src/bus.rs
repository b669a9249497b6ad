use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use triad_core::Message;

/// Non-owning delivery handle through which the bus reaches an agent's inbox.
#[derive(Clone)]
pub struct Subscription {
    pub agent: String,
    tx: mpsc::Sender<Message>,
}

impl Subscription {
    pub fn new(agent: impl Into<String>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            agent: agent.into(),
            tx,
        }
    }

    /// Attempt delivery without blocking. A full or closed inbox drops the
    /// message (loss is silent by design; the recorder provides capture).
    pub fn deliver(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(m)) => {
                tracing::warn!(agent = %self.agent, room = %m.room, "inbox full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// A named channel: current subscribers plus the raw in-memory message log.
struct Room {
    subscribers: Vec<Subscription>,
    log: Vec<Message>,
}

impl Room {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            log: Vec::new(),
        }
    }
}

/// In-process publish/subscribe bus. Rooms are created lazily on first
/// join/post and live for the process lifetime. One mutex guards the room
/// map; delivery happens on a snapshot of the subscriber set taken at post
/// time, so a per-subscriber failure never affects siblings.
pub struct Router {
    rooms: Mutex<HashMap<String, Room>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe an agent to a room. Idempotent per agent name.
    pub fn join(&self, room: &str, sub: Subscription) {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room.to_string()).or_insert_with(Room::new);
        if !room.subscribers.iter().any(|s| s.agent == sub.agent) {
            room.subscribers.push(sub);
        }
    }

    /// Remove an agent from a room. No error if it was never subscribed.
    pub fn leave(&self, room: &str, agent: &str) {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get_mut(room) {
            room.subscribers.retain(|s| s.agent != agent);
        }
    }

    /// Append the message to the room log and fan it out to every subscriber
    /// observed at post time.
    pub fn post(&self, msg: Message) {
        let targets = {
            let mut rooms = self.rooms.lock();
            let room = rooms.entry(msg.room.clone()).or_insert_with(Room::new);
            room.log.push(msg.clone());
            room.subscribers.clone()
        };
        for sub in targets {
            sub.deliver(msg.clone());
        }
    }

    /// Names of all rooms created so far.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.lock().keys().cloned().collect()
    }

    /// Snapshot of a room's raw message log; empty if the room doesn't exist.
    pub fn room_log(&self, room: &str) -> Vec<Message> {
        self.rooms
            .lock()
            .get(room)
            .map(|r| r.log.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .get(room)
            .map(|r| r.subscribers.len())
            .unwrap_or(0)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
