use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use triad_core::ids::WorkerId;

use crate::protocol::StormMessage;

/// A registered worker: its advertised capabilities, advisory load, liveness
/// timestamp, and the send queue of its live connection.
pub struct WorkerEntry {
    pub id: WorkerId,
    pub capabilities: HashSet<String>,
    load: Mutex<f64>,
    last_seen: AtomicU64,
    seq: u64,
    outbox: mpsc::Sender<String>,
}

impl WorkerEntry {
    pub fn load_factor(&self) -> f64 {
        *self.load.lock()
    }

    pub fn last_seen_secs(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_seen.store(now_secs(), Ordering::Relaxed);
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        now_secs().saturating_sub(self.last_seen_secs()) > threshold.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Snapshot row returned by `get_connected_agents`.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerInfo {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub load_factor: f64,
    pub last_heartbeat: u64,
    pub heartbeat_age_secs: u64,
}

/// Registry of currently-connected workers. Owned by one coordinator
/// instance; deliberately not shared across processes — workers re-register
/// after a coordinator restart.
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<WorkerEntry>>,
    next_seq: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a worker connection. A re-registration under the same id
    /// replaces the previous entry (capabilities and send queue).
    pub fn register(
        &self,
        id: WorkerId,
        capabilities: Vec<String>,
        outbox: mpsc::Sender<String>,
    ) -> Arc<WorkerEntry> {
        let entry = Arc::new(WorkerEntry {
            id: id.clone(),
            capabilities: capabilities.into_iter().collect(),
            load: Mutex::new(0.0),
            last_seen: AtomicU64::new(now_secs()),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            outbox,
        });
        self.workers.insert(id, Arc::clone(&entry));
        entry
    }

    pub fn deregister(&self, id: &WorkerId) -> bool {
        self.workers.remove(id).is_some()
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.workers.len()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    /// Refresh the liveness timestamp; every inbound envelope counts.
    pub fn touch(&self, id: &WorkerId) -> bool {
        match self.workers.get(id) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Update advisory load from a heartbeat, clamped to [0, 1].
    pub fn set_load(&self, id: &WorkerId, load_factor: f64) {
        if let Some(entry) = self.workers.get(id) {
            *entry.load.lock() = load_factor.clamp(0.0, 1.0);
        }
    }

    /// Serialize and enqueue an envelope for a worker's connection. Returns
    /// false for an unknown worker, a full queue, or a closed connection.
    pub fn send_to(&self, id: &WorkerId, msg: &StormMessage) -> bool {
        let Some(entry) = self.workers.get(id) else {
            return false;
        };
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "failed to serialize envelope");
                return false;
            }
        };
        match entry.outbox.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(worker = %id, "send queue full, dropping envelope");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Pick the least-loaded connected worker whose capability set covers
    /// `required`. Ties break by registration order.
    pub fn select(&self, required: &[String]) -> Option<WorkerId> {
        let mut best: Option<(f64, u64, WorkerId)> = None;
        for entry in self.workers.iter() {
            let worker = entry.value();
            if !required.iter().all(|c| worker.capabilities.contains(c)) {
                continue;
            }
            let load = worker.load_factor();
            let candidate = (load, worker.seq, worker.id.clone());
            let better = match &best {
                None => true,
                Some((best_load, best_seq, _)) => {
                    load < *best_load || (load == *best_load && worker.seq < *best_seq)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.map(|(_, _, id)| id)
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let now = now_secs();
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|entry| {
                let worker = entry.value();
                let last = worker.last_seen_secs();
                let mut capabilities: Vec<String> = worker.capabilities.iter().cloned().collect();
                capabilities.sort();
                WorkerInfo {
                    agent_id: worker.id.to_string(),
                    capabilities,
                    load_factor: worker.load_factor(),
                    last_heartbeat: last,
                    heartbeat_age_secs: now.saturating_sub(last),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }

    /// Drop every worker silent for longer than `threshold`, returning the
    /// evicted ids.
    pub fn evict_stale(&self, threshold: Duration) -> Vec<WorkerId> {
        let stale: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|entry| entry.value().is_stale(threshold))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.workers.remove(id);
        }
        stale
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
