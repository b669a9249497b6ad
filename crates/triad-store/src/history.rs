use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use triad_core::Message;

use crate::error::StoreError;
use crate::ledger::{CoreEntry, CoreLedger};

const SUMMARY_CONTENT_CHARS: usize = 160;

/// Per-room durability unit: bounded ring buffer of recent messages plus the
/// path of the append-only JSONL log.
struct RoomMemory {
    buffer: VecDeque<Message>,
    path: PathBuf,
}

/// Durable, replayable record of room activity plus the core-memory ledger.
///
/// Layout under the data directory:
///   rooms/<room>.jsonl   one JSON object per recorded message
///   core_memory.json     topic -> entries, atomically rewritten on mutation
pub struct HistoryStore {
    rooms_dir: PathBuf,
    capacity: usize,
    rooms: Mutex<HashMap<String, RoomMemory>>,
    core: CoreLedger,
}

impl HistoryStore {
    /// Open (or create) the store rooted at `data_dir`. `capacity` bounds the
    /// per-room ring buffer.
    pub fn open(data_dir: &Path, capacity: usize) -> Result<Self, StoreError> {
        let rooms_dir = data_dir.join("rooms");
        std::fs::create_dir_all(&rooms_dir)?;
        Ok(Self {
            rooms_dir,
            capacity,
            rooms: Mutex::new(HashMap::new()),
            core: CoreLedger::open(data_dir.join("core_memory.json")),
        })
    }

    /// Record a message: ring-buffer append (oldest evicted past capacity)
    /// plus one line in the room's JSONL log. Never fails visibly — this sits
    /// on the bus delivery path, so I/O errors are logged and swallowed.
    pub fn record(&self, msg: &Message) {
        let mut rooms = self.rooms.lock();
        let room = self.room_entry(&mut rooms, &msg.room);
        if room.buffer.len() == self.capacity {
            room.buffer.pop_front();
        }
        room.buffer.push_back(msg.clone());

        match serde_json::to_string(msg) {
            Ok(line) => {
                if let Err(e) = append_line(&room.path, &line) {
                    tracing::warn!(room = %msg.room, error = %e, "failed to append history line");
                }
            }
            Err(e) => {
                tracing::warn!(room = %msg.room, error = %e, "failed to serialize message");
            }
        }
    }

    /// Snapshot of the room's buffered messages in insertion order. Covers the
    /// ring buffer only, not the full on-disk log.
    pub fn iterate(&self, room: &str) -> Vec<Message> {
        let mut rooms = self.rooms.lock();
        self.room_entry(&mut rooms, room).buffer.iter().cloned().collect()
    }

    /// Render the last `limit` buffered messages as "sender: content" lines.
    /// Content is newline-flattened and truncated; no side effects.
    pub fn summarize(&self, room: &str, limit: usize) -> String {
        let messages = self.iterate(room);
        let skip = messages.len().saturating_sub(limit);
        messages
            .iter()
            .skip(skip)
            .map(|m| {
                let flat = m.content.trim().replace('\n', " ");
                let truncated: String = flat.chars().take(SUMMARY_CONTENT_CHARS).collect();
                format!("{}: {}", m.sender, truncated)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // core memory passthrough

    pub fn core_set(&self, topic: &str, text: &str) -> Result<(), StoreError> {
        self.core.set(topic, text)
    }

    pub fn core_get(&self, topic: &str) -> Vec<CoreEntry> {
        self.core.get(topic)
    }

    pub fn core_list(&self) -> Vec<String> {
        self.core.topics()
    }

    pub fn core_delete(&self, topic: &str) -> Result<bool, StoreError> {
        self.core.delete(topic)
    }

    fn room_entry<'a>(
        &self,
        rooms: &'a mut HashMap<String, RoomMemory>,
        room: &str,
    ) -> &'a mut RoomMemory {
        rooms.entry(room.to_string()).or_insert_with(|| {
            let path = self.rooms_dir.join(format!("{room}.jsonl"));
            RoomMemory {
                buffer: load_tail(&path, self.capacity),
                path,
            }
        })
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// Warm a room buffer from the tail of an existing log, best-effort.
/// Unparseable lines are skipped with a warning.
fn load_tail(path: &Path, capacity: usize) -> VecDeque<Message> {
    let mut buffer = VecDeque::new();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return buffer,
    };
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<Message>(line) {
            Ok(msg) => {
                if buffer.len() == capacity {
                    buffer.pop_front();
                }
                buffer.push_back(msg);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unparseable history line");
            }
        }
    }
    buffer
}
