use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One note appended under a core-memory topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CoreEntry {
    pub ts: DateTime<Utc>,
    pub text: String,
}

/// Topic-indexed long-term note ledger, mirrored by a single JSON file.
/// Every mutation rewrites the file atomically (temp file + rename), so a
/// crash mid-write never leaves a corrupt ledger on disk.
pub struct CoreLedger {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, Vec<CoreEntry>>>,
}

impl CoreLedger {
    /// Open the ledger at `path`, loading any existing contents best-effort.
    /// A missing or unreadable file starts the ledger empty.
    pub fn open(path: PathBuf) -> Self {
        let cache = load(&path);
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    /// Append an entry under `topic`. Appends only; prior entries are never
    /// overwritten. The topic is trimmed, and an empty topic is rejected.
    pub fn set(&self, topic: &str, text: &str) -> Result<(), StoreError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(StoreError::InvalidTopic(topic.to_string()));
        }
        let mut cache = self.cache.lock();
        cache.entry(topic.to_string()).or_default().push(CoreEntry {
            ts: Utc::now(),
            text: text.trim().to_string(),
        });
        self.rewrite(&cache)
    }

    /// All entries for a topic in append order; empty if the topic is unknown.
    pub fn get(&self, topic: &str) -> Vec<CoreEntry> {
        self.cache.lock().get(topic).cloned().unwrap_or_default()
    }

    /// Sorted list of known topics.
    pub fn topics(&self) -> Vec<String> {
        self.cache.lock().keys().cloned().collect()
    }

    /// Delete a topic wholesale. Returns false if it was not present.
    pub fn delete(&self, topic: &str) -> Result<bool, StoreError> {
        let mut cache = self.cache.lock();
        if cache.remove(topic).is_none() {
            return Ok(false);
        }
        self.rewrite(&cache)?;
        Ok(true)
    }

    fn rewrite(&self, cache: &BTreeMap<String, Vec<CoreEntry>>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(cache)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn load(path: &std::path::Path) -> BTreeMap<String, Vec<CoreEntry>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_str(&text) {
        Ok(cache) => cache,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt core memory file, starting empty");
            BTreeMap::new()
        }
    }
}
