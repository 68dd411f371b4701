//! Core domain types: tasks, priority/effort tiers, idle tasks and thoughts.

mod id;
mod idle;
mod priority;
mod task;
mod thought;

pub use id::new_id;
pub use idle::IdleTask;
pub use priority::{Effort, Priority, QueueKey};
pub use task::{
    Artifact, Autonomy, Checkpoint, ContainerDescriptor, LogEntry, LogLevel, PauseReason, Task, TaskStatus, Usage,
    WorkspaceDescriptor, WorkspaceStrategy,
};
pub use thought::Thought;
