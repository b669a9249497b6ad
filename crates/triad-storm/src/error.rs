use triad_core::ids::TaskId;

use crate::task::TaskStatus;

#[derive(Debug, thiserror::Error)]
pub enum StormError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task {id} is already {status}")]
    TaskTerminal { id: TaskId, status: TaskStatus },
}
