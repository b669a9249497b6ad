use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use triad_core::ids::{TaskId, WorkerId};

use crate::error::StormError;
use crate::protocol::{
    payload_of, EnvelopeKind, HeartbeatPayload, StormMessage, TaskRequestPayload,
    TaskResponsePayload, TaskUpdatePayload, UpdateAction, SERVICE_NAME,
};
use crate::task::{TaskDefinition, TaskSpec, TaskStatus};
use crate::workers::{WorkerInfo, WorkerRegistry};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Period of the pending-task retry/timeout sweep.
    pub sweep_interval: Duration,
    /// Period of the stale-worker check.
    pub heartbeat_interval: Duration,
    /// A worker silent for longer than this is deregistered.
    pub staleness_threshold: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(60),
        }
    }
}

/// Aggregate counters surfaced by the health endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub connected_agents: usize,
    pub active_tasks: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
}

/// Dispatches submitted tasks to capability-matched, least-loaded workers and
/// tracks their lifecycle. All state is owned by the instance (constructor-
/// injected, never global), so independent coordinators coexist in tests.
pub struct Coordinator {
    workers: Arc<WorkerRegistry>,
    tasks: Mutex<HashMap<TaskId, TaskDefinition>>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            workers: Arc::new(WorkerRegistry::new()),
            tasks: Mutex::new(HashMap::new()),
            config,
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Create a task in `pending` and immediately attempt assignment.
    pub fn submit_task(&self, spec: TaskSpec) -> TaskId {
        let task = TaskDefinition::new(spec);
        let id = task.id.clone();
        self.tasks.lock().insert(id.clone(), task);
        tracing::info!(task = %id, "task submitted");
        self.try_assign(&id);
        id
    }

    pub fn task(&self, id: &TaskId) -> Option<TaskDefinition> {
        self.tasks.lock().get(id).cloned()
    }

    /// Cancel a pending or running task. A running task's worker gets a
    /// best-effort `task_update { action: cancel }`; no acknowledgement is
    /// required.
    pub fn cancel_task(&self, id: &TaskId) -> Result<(), StormError> {
        let assigned = {
            let mut tasks = self.tasks.lock();
            let task = tasks.get_mut(id).ok_or_else(|| StormError::UnknownTask(id.clone()))?;
            if task.status.is_terminal() {
                return Err(StormError::TaskTerminal {
                    id: id.clone(),
                    status: task.status,
                });
            }
            task.status = TaskStatus::Cancelled;
            task.assigned_agent.clone()
        };

        if let Some(worker) = assigned {
            let msg = StormMessage::new(EnvelopeKind::TaskUpdate, SERVICE_NAME)
                .to(worker.as_str())
                .with_payload(payload_of(&TaskUpdatePayload {
                    task_id: id.clone(),
                    action: UpdateAction::Cancel,
                }));
            if !self.workers.send_to(&worker, &msg) {
                tracing::warn!(task = %id, worker = %worker, "cancel notification not delivered");
            }
        }
        tracing::info!(task = %id, "task cancelled");
        Ok(())
    }

    /// Attempt to assign a pending task to the least-loaded capable worker.
    /// A failed send rolls the task back to pending and drops the worker.
    pub fn try_assign(&self, id: &TaskId) -> bool {
        let dispatch = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(id) else {
                return false;
            };
            if task.status != TaskStatus::Pending {
                return false;
            }
            let Some(worker) = self.workers.select(&task.required_capabilities) else {
                return false;
            };
            task.assigned_agent = Some(worker.clone());
            task.status = TaskStatus::Running;
            (task.offer(), worker)
        };

        let (offer, worker) = dispatch;
        let msg = StormMessage::new(EnvelopeKind::TaskRequest, SERVICE_NAME)
            .to(worker.as_str())
            .with_payload(payload_of(&TaskRequestPayload { task: offer }));

        if self.workers.send_to(&worker, &msg) {
            tracing::info!(task = %id, worker = %worker, "task assigned");
            return true;
        }

        // Worker vanished between selection and send: drop it and put the
        // task back in the queue for the next sweep.
        tracing::warn!(task = %id, worker = %worker, "dispatch failed, rolling back");
        self.workers.deregister(&worker);
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get_mut(id) {
            task.assigned_agent = None;
            task.status = TaskStatus::Pending;
        }
        false
    }

    /// Handle a post-registration envelope from a known worker. Every
    /// inbound envelope refreshes the worker's liveness.
    pub fn handle_envelope(&self, from: &WorkerId, msg: &StormMessage) {
        self.workers.touch(from);
        match msg.kind {
            EnvelopeKind::TaskResponse => self.on_task_response(from, msg),
            EnvelopeKind::AgentHeartbeat => match msg.payload_as::<HeartbeatPayload>() {
                Ok(hb) => self.workers.set_load(from, hb.load_factor),
                Err(e) => {
                    tracing::warn!(worker = %from, error = %e, "malformed heartbeat payload")
                }
            },
            EnvelopeKind::AgentRegistration => {
                tracing::debug!(worker = %from, "registration handled at the connection layer");
            }
            EnvelopeKind::TaskRequest => {
                tracing::warn!(worker = %from, "worker sent a server-only envelope");
            }
            EnvelopeKind::TaskUpdate | EnvelopeKind::Coordination | EnvelopeKind::Broadcast => {
                tracing::debug!(worker = %from, kind = %msg.kind, "envelope noted");
            }
        }
    }

    fn on_task_response(&self, from: &WorkerId, msg: &StormMessage) {
        let payload: TaskResponsePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(worker = %from, error = %e, "malformed task response");
                return;
            }
        };

        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(&payload.task_id) else {
            tracing::debug!(task = %payload.task_id, worker = %from, "response for unknown task ignored");
            return;
        };
        if task.status.is_terminal() {
            tracing::debug!(task = %task.id, "response for terminal task ignored");
            return;
        }
        if task.assigned_agent.as_ref() != Some(from) {
            tracing::warn!(task = %task.id, worker = %from, "response from non-assigned worker ignored");
            return;
        }

        if payload.success {
            task.status = TaskStatus::Completed;
            task.result = payload.result;
            tracing::info!(task = %task.id, worker = %from, "task completed");
        } else {
            task.status = TaskStatus::Failed;
            task.error = Some(payload.error.unwrap_or_else(|| "Unknown error".into()));
            tracing::warn!(task = %task.id, worker = %from, "task failed");
        }
    }

    /// One scheduler pass: fail pending tasks past their timeout, retry
    /// assignment for the rest (priority desc, then submission order).
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut retry = Vec::new();
        {
            let mut tasks = self.tasks.lock();
            let mut pending: Vec<&mut TaskDefinition> = tasks
                .values_mut()
                .filter(|t| t.status == TaskStatus::Pending)
                .collect();
            pending.sort_by(|a, b| {
                b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at))
            });
            for task in pending {
                if task.is_expired(now) {
                    task.status = TaskStatus::Failed;
                    task.error = Some("Task timeout".into());
                    tracing::warn!(task = %task.id, "task timed out before assignment");
                } else {
                    retry.push(task.id.clone());
                }
            }
        }
        for id in retry {
            self.try_assign(&id);
        }
    }

    /// One liveness pass: deregister workers past the staleness threshold.
    /// Tasks already running on an evicted worker are left as-is.
    pub fn evict_stale_workers(&self) -> Vec<WorkerId> {
        let evicted = self.workers.evict_stale(self.config.staleness_threshold);
        for worker in &evicted {
            tracing::warn!(worker = %worker, "stale worker deregistered");
        }
        evicted
    }

    /// Send an envelope to every connected worker, best-effort. A worker
    /// whose send fails is dropped, not retried.
    pub fn broadcast_message(&self, kind: EnvelopeKind, payload: Value) -> usize {
        let mut delivered = 0;
        for id in self.workers.ids() {
            let msg = StormMessage::new(kind, SERVICE_NAME)
                .to(id.as_str())
                .with_payload(payload.clone());
            if self.workers.send_to(&id, &msg) {
                delivered += 1;
            } else {
                tracing::warn!(worker = %id, "broadcast delivery failed, dropping worker");
                self.workers.deregister(&id);
            }
        }
        delivered
    }

    /// Notify a set of workers that they participate in a coordination
    /// session. Best-effort; returns the number of notified workers.
    pub fn coordination_session(
        &self,
        session_id: &str,
        participants: &[String],
        goal: &str,
        context: Value,
    ) -> usize {
        let payload = payload_of(&crate::protocol::CoordinationPayload {
            action: "create_session".into(),
            session_id: session_id.to_string(),
            participating_agents: participants.to_vec(),
            coordination_goal: goal.to_string(),
            context,
        });

        let mut notified = 0;
        for name in participants {
            let id = WorkerId::from_raw(name.clone());
            if !self.workers.contains(&id) {
                continue;
            }
            let msg = StormMessage::new(EnvelopeKind::Coordination, SERVICE_NAME)
                .to(name)
                .with_payload(payload.clone());
            if self.workers.send_to(&id, &msg) {
                notified += 1;
            }
        }
        notified
    }

    pub fn get_connected_agents(&self) -> Vec<WorkerInfo> {
        self.workers.snapshot()
    }

    pub fn system_status(&self) -> SystemStatus {
        let tasks = self.tasks.lock();
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for task in tasks.values() {
            *by_status.entry(task.status.to_string()).or_default() += 1;
        }
        SystemStatus {
            connected_agents: self.workers.count(),
            active_tasks: tasks.len(),
            tasks_by_status: by_status,
        }
    }

    /// Spawn the periodic sweep and heartbeat loops. Each is cancellable and
    /// joined by `stop`.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }

        let sweeper = Arc::clone(self);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = sweeper.cancel.cancelled() => break,
                    _ = ticker.tick() => sweeper.sweep(),
                }
            }
        }));

        let monitor = Arc::clone(self);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.evict_stale_workers();
                    }
                }
            }
        }));
    }

    /// Cancel the background loops and await their termination.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig::default())
    }

    fn connect(c: &Coordinator, id: &str, caps: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        c.workers().register(
            WorkerId::from_raw(id),
            caps.iter().map(|s| s.to_string()).collect(),
            tx,
        );
        rx
    }

    fn respond(c: &Coordinator, worker: &str, task_id: &TaskId, success: bool, result: Option<Value>) {
        let msg = StormMessage::new(EnvelopeKind::TaskResponse, worker).with_payload(payload_of(
            &TaskResponsePayload {
                task_id: task_id.clone(),
                success,
                result,
                error: if success { None } else { Some("boom".into()) },
            },
        ));
        c.handle_envelope(&WorkerId::from_raw(worker), &msg);
    }

    #[tokio::test]
    async fn task_without_capable_worker_stays_pending() {
        let c = coordinator();
        let _rx = connect(&c, "w1", &["compile"]);
        let id = c.submit_task(TaskSpec::new("deploy", "d").require("deploy"));
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn full_lifecycle_pending_running_completed() {
        let c = coordinator();
        let id = c.submit_task(TaskSpec::new("echo", "say it back"));
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Pending);

        let mut rx = connect(&c, "w1", &[]);
        c.sweep();

        let task = c.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_agent, Some(WorkerId::from_raw("w1")));

        // The worker received the task_request.
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""type":"task_request""#));
        assert!(frame.contains(id.as_str()));

        respond(&c, "w1", &id, true, Some(Value::String("ok".into())));
        let task = c.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(Value::String("ok".into())));
    }

    #[tokio::test]
    async fn immediate_assignment_on_submit() {
        let c = coordinator();
        let mut rx = connect(&c, "w1", &["echo"]);
        let id = c.submit_task(TaskSpec::new("echo", "d").require("echo"));
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Running);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn failure_response_records_error() {
        let c = coordinator();
        let _rx = connect(&c, "w1", &[]);
        let id = c.submit_task(TaskSpec::new("echo", "d"));

        respond(&c, "w1", &id, false, None);
        let task = c.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn response_for_terminal_task_ignored() {
        let c = coordinator();
        let _rx = connect(&c, "w1", &[]);
        let id = c.submit_task(TaskSpec::new("echo", "d"));

        respond(&c, "w1", &id, true, Some(Value::String("first".into())));
        respond(&c, "w1", &id, false, None);

        let task = c.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(Value::String("first".into())));
    }

    #[tokio::test]
    async fn response_from_non_assigned_worker_ignored() {
        let c = coordinator();
        let _rx1 = connect(&c, "w1", &[]);
        let id = c.submit_task(TaskSpec::new("echo", "d"));
        assert_eq!(c.task(&id).unwrap().assigned_agent, Some(WorkerId::from_raw("w1")));

        let _rx2 = connect(&c, "intruder", &[]);
        respond(&c, "intruder", &id, true, None);
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn least_loaded_worker_wins() {
        let c = coordinator();
        let _rx1 = connect(&c, "busy", &[]);
        let mut rx2 = connect(&c, "idle", &[]);
        c.workers().set_load(&WorkerId::from_raw("busy"), 0.9);
        c.workers().set_load(&WorkerId::from_raw("idle"), 0.1);

        let id = c.submit_task(TaskSpec::new("echo", "d"));
        assert_eq!(c.task(&id).unwrap().assigned_agent, Some(WorkerId::from_raw("idle")));
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dead_outbox_rolls_back_and_drops_worker() {
        let c = coordinator();
        let rx = connect(&c, "w1", &[]);
        drop(rx); // connection gone before dispatch

        let id = c.submit_task(TaskSpec::new("echo", "d"));
        let task = c.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert_eq!(c.workers().count(), 0);
    }

    #[tokio::test]
    async fn sweep_times_out_old_pending_tasks() {
        let c = coordinator();
        let id = c.submit_task(TaskSpec::new("echo", "d").with_timeout(1));

        // Backdate the task past its timeout.
        {
            let mut tasks = c.tasks.lock();
            let task = tasks.get_mut(&id).unwrap();
            task.created_at = Utc::now() - chrono::Duration::seconds(5);
        }
        c.sweep();

        let task = c.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Task timeout"));
    }

    #[tokio::test]
    async fn sweep_assigns_higher_priority_first() {
        let c = coordinator();
        let low = c.submit_task(TaskSpec::new("echo", "low").with_priority(1));
        let high = c.submit_task(TaskSpec::new("echo", "high").with_priority(9));

        // One worker with a single-slot queue: only the first dispatch lands.
        let (tx, mut rx) = mpsc::channel(1);
        c.workers().register(WorkerId::from_raw("w1"), vec![], tx);
        c.sweep();

        assert_eq!(c.task(&high).unwrap().status, TaskStatus::Running);
        assert_eq!(c.task(&low).unwrap().status, TaskStatus::Pending);
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(high.as_str()));
    }

    #[tokio::test]
    async fn cancel_pending_task() {
        let c = coordinator();
        let id = c.submit_task(TaskSpec::new("echo", "d"));
        c.cancel_task(&id).unwrap();
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_running_task_notifies_worker() {
        let c = coordinator();
        let mut rx = connect(&c, "w1", &[]);
        let id = c.submit_task(TaskSpec::new("echo", "d"));
        let _ = rx.try_recv().unwrap(); // task_request

        c.cancel_task(&id).unwrap();
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Cancelled);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""type":"task_update""#));
        assert!(frame.contains(r#""action":"cancel""#));
    }

    #[tokio::test]
    async fn cancel_terminal_or_unknown_rejected() {
        let c = coordinator();
        let _rx = connect(&c, "w1", &[]);
        let id = c.submit_task(TaskSpec::new("echo", "d"));
        respond(&c, "w1", &id, true, None);

        assert!(matches!(
            c.cancel_task(&id),
            Err(StormError::TaskTerminal { status: TaskStatus::Completed, .. })
        ));
        assert!(matches!(
            c.cancel_task(&TaskId::from_raw("task_missing")),
            Err(StormError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_updates_load() {
        let c = coordinator();
        let _rx = connect(&c, "w1", &[]);
        let msg = StormMessage::new(EnvelopeKind::AgentHeartbeat, "w1")
            .with_payload(payload_of(&HeartbeatPayload { load_factor: 0.7 }));
        c.handle_envelope(&WorkerId::from_raw("w1"), &msg);

        assert_eq!(c.get_connected_agents()[0].load_factor, 0.7);
    }

    #[tokio::test]
    async fn evicted_worker_leaves_running_task_untouched() {
        let c = coordinator();
        let _rx = connect(&c, "w1", &[]);
        let id = c.submit_task(TaskSpec::new("echo", "d"));
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Running);

        // A freshly registered worker is not stale at the default threshold.
        assert!(c.workers().evict_stale(Duration::from_secs(60)).is_empty());

        // After a second of silence a zero threshold evicts it.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let evicted = c.workers().evict_stale(Duration::from_secs(0));
        assert_eq!(evicted, vec![WorkerId::from_raw("w1")]);

        // The in-flight task stays running with its assignee intact.
        let task = c.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_agent, Some(WorkerId::from_raw("w1")));
        assert!(c.get_connected_agents().is_empty());
    }

    #[tokio::test]
    async fn broadcast_drops_unreachable_workers() {
        let c = coordinator();
        let mut rx1 = connect(&c, "alive", &[]);
        let rx2 = connect(&c, "gone", &[]);
        drop(rx2);

        let delivered = c.broadcast_message(EnvelopeKind::Broadcast, serde_json::json!({"note": "hi"}));
        assert_eq!(delivered, 1);
        assert_eq!(c.workers().count(), 1);
        assert!(rx1.try_recv().unwrap().contains("broadcast"));
    }

    #[tokio::test]
    async fn coordination_session_notifies_connected_participants() {
        let c = coordinator();
        let mut rx = connect(&c, "w1", &[]);
        let _rx2 = connect(&c, "w2", &[]);

        let notified = c.coordination_session(
            "sess-1",
            &["w1".to_string(), "offline".to_string()],
            "plan the release",
            serde_json::json!({}),
        );
        assert_eq!(notified, 1);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""type":"coordination""#));
        assert!(frame.contains("plan the release"));
    }

    #[tokio::test]
    async fn system_status_counts() {
        let c = coordinator();
        let _rx = connect(&c, "w1", &[]);
        let running = c.submit_task(TaskSpec::new("echo", "d"));
        let _pending = c.submit_task(TaskSpec::new("deploy", "d").require("deploy"));
        respond(&c, "w1", &running, true, None);

        let status = c.system_status();
        assert_eq!(status.connected_agents, 1);
        assert_eq!(status.active_tasks, 2);
        assert_eq!(status.tasks_by_status.get("completed"), Some(&1));
        assert_eq!(status.tasks_by_status.get("pending"), Some(&1));
    }

    #[tokio::test]
    async fn background_loops_start_and_stop() {
        let c = Arc::new(Coordinator::new(CoordinatorConfig {
            sweep_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(10),
            staleness_threshold: Duration::from_secs(60),
        }));
        c.start();
        c.start(); // idempotent

        let _rx = connect(&c, "w1", &[]);
        let id = c.submit_task(TaskSpec::new("echo", "d").require("late"));
        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Pending);

        // Give the worker the missing capability via re-registration; the
        // sweep loop should pick the task up.
        let (tx, mut rx2) = mpsc::channel(16);
        c.workers().register(WorkerId::from_raw("w1"), vec!["late".into()], tx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(c.task(&id).unwrap().status, TaskStatus::Running);
        assert!(rx2.try_recv().is_ok());

        c.stop().await;
    }
}
