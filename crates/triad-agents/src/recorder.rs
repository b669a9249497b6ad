use std::sync::Arc;

use async_trait::async_trait;

use triad_core::Message;
use triad_store::HistoryStore;

use crate::agent::{AgentContext, AgentError, MessageHandler};

/// Silent observer that persists every delivered message to the history
/// store. Never replies and never fails the bus.
pub struct Recorder {
    store: Arc<HistoryStore>,
}

impl Recorder {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&mut self, _ctx: &AgentContext, msg: &Message) -> Result<(), AgentError> {
        self.store.record(msg);
        Ok(())
    }
}
