use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use triad_core::{ChatRole, Message};

use crate::bus::{Router, Subscription};

const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Role descriptor shown alongside an agent's name.
#[derive(Clone, Debug)]
pub struct Role {
    pub name: String,
    pub icon: String,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: "•".into(),
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::new("agent")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("handler failure: {0}")]
    Handler(String),

    #[error("agent not attached to a router")]
    Detached,

    #[error("agent already running")]
    AlreadyRunning,

    #[error("agent is stopped")]
    Stopped,
}

impl AgentError {
    /// Short classification string used in `[error]` replies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "handler",
            Self::Detached => "detached",
            Self::AlreadyRunning => "already_running",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    Stopped,
}

/// Per-message callback implemented by each agent kind. Calls are strictly
/// serialized by the owning agent's loop, so `&mut self` state needs no
/// further synchronization.
#[async_trait]
pub trait MessageHandler: Send + 'static {
    async fn handle(&mut self, ctx: &AgentContext, msg: &Message) -> Result<(), AgentError>;
}

/// The identity an agent speaks with, plus the router to speak through.
#[derive(Clone)]
pub struct AgentContext {
    pub name: String,
    pub role: Role,
    router: Arc<Router>,
}

impl AgentContext {
    /// Construct a message from this agent's identity and post it.
    pub fn say(&self, room: &str, content: impl Into<String>, role: ChatRole) {
        self.router.post(Message::new(room, &self.name, content, role));
    }

    pub fn say_with_meta(
        &self,
        room: &str,
        content: impl Into<String>,
        role: ChatRole,
        meta: serde_json::Map<String, serde_json::Value>,
    ) {
        self.router
            .post(Message::new(room, &self.name, content, role).with_meta(meta));
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

/// A named actor with a single-consumer inbox and one background processing
/// loop. The bus only ever holds the `Subscription` handle; the agent owns
/// its inbox receiver exclusively.
pub struct Agent {
    name: String,
    role: Role,
    router: Option<Arc<Router>>,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Option<mpsc::Receiver<Message>>,
    state: AgentState,
    cancel: CancellationToken,
    loop_handle: Option<JoinHandle<()>>,
}

impl Agent {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self::with_capacity(name, role, DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, role: Role, capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity);
        Self {
            name: name.into(),
            role,
            router: None,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            state: AgentState::Idle,
            cancel: CancellationToken::new(),
            loop_handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Wire this agent to a bus. Must precede `join`/`say`/`start`.
    pub fn attach(&mut self, router: Arc<Router>) {
        self.router = Some(router);
    }

    /// The delivery handle the bus posts through.
    pub fn subscription(&self) -> Subscription {
        Subscription::new(self.name.clone(), self.inbox_tx.clone())
    }

    pub fn join(&self, room: &str) -> Result<(), AgentError> {
        let router = self.router.as_ref().ok_or(AgentError::Detached)?;
        router.join(room, self.subscription());
        Ok(())
    }

    pub fn leave(&self, room: &str) -> Result<(), AgentError> {
        let router = self.router.as_ref().ok_or(AgentError::Detached)?;
        router.leave(room, &self.name);
        Ok(())
    }

    pub fn context(&self) -> Result<AgentContext, AgentError> {
        let router = self.router.as_ref().ok_or(AgentError::Detached)?;
        Ok(AgentContext {
            name: self.name.clone(),
            role: self.role.clone(),
            router: Arc::clone(router),
        })
    }

    pub fn say(&self, room: &str, content: impl Into<String>, role: ChatRole) -> Result<(), AgentError> {
        self.context()?.say(room, content, role);
        Ok(())
    }

    /// Spawn the processing loop. Exactly one loop per agent; messages are
    /// handled sequentially. A handler error is caught, logged, and answered
    /// with an `[error] <kind>: <message>` system reply into the originating
    /// room — the loop itself never dies on handler errors.
    pub fn start(&mut self, handler: Box<dyn MessageHandler>) -> Result<(), AgentError> {
        match self.state {
            AgentState::Running => return Err(AgentError::AlreadyRunning),
            AgentState::Stopped => return Err(AgentError::Stopped),
            AgentState::Idle => {}
        }
        let ctx = self.context()?;
        let rx = self.inbox_rx.take().ok_or(AgentError::Stopped)?;
        let cancel = self.cancel.clone();
        self.loop_handle = Some(tokio::spawn(run_loop(ctx, rx, handler, cancel)));
        self.state = AgentState::Running;
        Ok(())
    }

    /// Cancel the loop and await its termination. After `stop` resolves, no
    /// message is ever delivered to the handler again.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
        self.state = AgentState::Stopped;
    }
}

async fn run_loop(
    ctx: AgentContext,
    mut rx: mpsc::Receiver<Message>,
    mut handler: Box<dyn MessageHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = handler.handle(&ctx, &msg).await {
                    tracing::warn!(agent = %ctx.name, room = %msg.room, error = %e, "handler failed");
                    ctx.say(&msg.room, format!("[error] {}: {e}", e.kind()), ChatRole::System);
                }
            }
        }
    }
    tracing::debug!(agent = %ctx.name, "agent loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Parrot;

    #[async_trait]
    impl MessageHandler for Parrot {
        async fn handle(&mut self, ctx: &AgentContext, msg: &Message) -> Result<(), AgentError> {
            // Only answer other senders, or the echo loops forever.
            if msg.sender != ctx.name {
                ctx.say(&msg.room, format!("heard: {}", msg.content), ChatRole::Assistant);
            }
            Ok(())
        }
    }

    struct Grump;

    #[async_trait]
    impl MessageHandler for Grump {
        async fn handle(&mut self, _ctx: &AgentContext, msg: &Message) -> Result<(), AgentError> {
            if msg.sender == "grump" {
                return Ok(());
            }
            Err(AgentError::Handler("nope".into()))
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Counter {
        async fn handle(&mut self, _ctx: &AgentContext, _msg: &Message) -> Result<(), AgentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn attached(name: &str, router: &Arc<Router>) -> Agent {
        let mut agent = Agent::new(name, Role::new("tester"));
        agent.attach(Arc::clone(router));
        agent
    }

    #[tokio::test]
    async fn handler_receives_posted_messages() {
        let router = Arc::new(Router::new());
        let mut parrot = attached("parrot", &router);
        parrot.join("main").unwrap();
        parrot.start(Box::new(Parrot)).unwrap();

        router.post(Message::user("main", "you", "ping"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let log = router.room_log("main");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].sender, "parrot");
        assert_eq!(log[1].content, "heard: ping");
        parrot.stop().await;
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let router = Arc::new(Router::new());
        let mut grump = attached("grump", &router);
        grump.join("main").unwrap();
        grump.start(Box::new(Grump)).unwrap();

        router.post(Message::user("main", "you", "do it"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let log = router.room_log("main");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].sender, "grump");
        assert_eq!(log[1].role, ChatRole::System);
        assert_eq!(log[1].content, "[error] handler: handler failure: nope");
        grump.stop().await;
    }

    #[tokio::test]
    async fn loop_survives_handler_errors() {
        let router = Arc::new(Router::new());
        let mut grump = attached("grump", &router);
        grump.join("main").unwrap();
        grump.start(Box::new(Grump)).unwrap();

        router.post(Message::user("main", "you", "first"));
        router.post(Message::user("main", "you", "second"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let errors = router
            .room_log("main")
            .iter()
            .filter(|m| m.content.starts_with("[error]"))
            .count();
        assert_eq!(errors, 2);
        grump.stop().await;
    }

    #[tokio::test]
    async fn stop_prevents_further_handling() {
        let router = Arc::new(Router::new());
        let count = Arc::new(AtomicUsize::new(0));
        let mut agent = attached("counter", &router);
        agent.join("main").unwrap();
        agent.start(Box::new(Counter(Arc::clone(&count)))).unwrap();

        router.post(Message::user("main", "you", "one"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.stop().await;
        assert_eq!(agent.state(), AgentState::Stopped);

        router.post(Message::user("main", "you", "two"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let router = Arc::new(Router::new());
        let mut agent = attached("solo", &router);
        agent.start(Box::new(Parrot)).unwrap();
        assert!(matches!(agent.start(Box::new(Parrot)), Err(AgentError::AlreadyRunning)));
        agent.stop().await;
        assert!(matches!(agent.start(Box::new(Parrot)), Err(AgentError::Stopped)));
    }

    #[tokio::test]
    async fn detached_agent_cannot_join_or_say() {
        let agent = Agent::new("loner", Role::default());
        assert!(matches!(agent.join("main"), Err(AgentError::Detached)));
        assert!(matches!(
            agent.say("main", "hi", ChatRole::Assistant),
            Err(AgentError::Detached)
        ));
    }

    #[tokio::test]
    async fn say_stamps_identity() {
        let router = Arc::new(Router::new());
        let mut agent = attached("voice", &router);
        agent.join("main").unwrap();
        agent.say("main", "present", ChatRole::Assistant).unwrap();

        let log = router.room_log("main");
        assert_eq!(log[0].sender, "voice");
        assert_eq!(log[0].role, ChatRole::Assistant);
    }
}
