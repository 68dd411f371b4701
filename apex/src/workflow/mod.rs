//! Stage-DAG execution of a task against an external LLM provider.

mod engine;
mod stage;

pub use engine::{ToolExecutor, WorkflowEngine, WorkflowError};
pub use stage::{detect_session_limit, SessionLimitStatus, SessionRecommendation, StageDefinition, WorkflowDefinition};
