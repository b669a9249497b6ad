pub mod ids;
pub mod messages;

pub use messages::{ChatRole, Message};
