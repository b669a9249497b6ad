pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod server;
pub mod task;
pub mod workers;

pub use coordinator::{Coordinator, CoordinatorConfig, SystemStatus};
pub use error::StormError;
pub use protocol::{EnvelopeKind, StormMessage, SERVICE_NAME};
pub use server::{start, StormConfig, StormHandle};
pub use task::{TaskDefinition, TaskSpec, TaskStatus};
pub use workers::{WorkerInfo, WorkerRegistry};
