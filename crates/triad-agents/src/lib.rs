pub mod agent;
pub mod bus;
pub mod modes;
pub mod recorder;

pub use agent::{Agent, AgentContext, AgentError, AgentState, MessageHandler, Role};
pub use bus::{Router, Subscription};
pub use modes::{ModeError, ModeFlags, ModeRegistry, RoomMode};
pub use recorder::Recorder;
