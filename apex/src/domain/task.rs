//! The unified `Task` record and its nested value types.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, now_ms};

use super::priority::{Effort, Priority};

/// Status a task's lifecycle may occupy. Transitions are enforced by the
/// store wrapper, not by this type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal for execution (archiving/trashing is
    /// still permitted from a terminal status).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// True if `self -> next` is one of the transitions allowed by §3.
    /// `Paused -> Failed` is the one exception to "paused -> {in-progress|
    /// cancelled}": it fires when a resume attempt finds `resumeAttempts`
    /// already at `maxResumeAttempts`, per the max-resume-attempts loop
    /// breaker.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, Paused)
                | (Paused, InProgress)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

/// How autonomously the workflow engine may act without pausing for review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autonomy {
    Low,
    Medium,
    High,
}

impl Default for Autonomy {
    fn default() -> Self {
        Autonomy::Medium
    }
}

/// Reason a task is sitting in `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    SessionLimit,
    UsageLimit,
    Budget,
    Capacity,
    Manual,
    Dependency,
}

impl PauseReason {
    /// Reasons the Runner's auto-resumer considers eligible for a retry,
    /// per `getPausedTasksForResume`.
    pub fn auto_resumable(&self) -> bool {
        matches!(
            self,
            PauseReason::SessionLimit | PauseReason::UsageLimit | PauseReason::Capacity | PauseReason::Budget
        )
    }
}

/// Cumulative token/cost usage for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

/// Isolation strategy and descriptor for a task's workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStrategy {
    None,
    Worktree,
    Container,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub image: String,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    pub strategy: WorkspaceStrategy,
    pub path: Option<String>,
    pub cleanup: bool,
    pub container: Option<ContainerDescriptor>,
}

impl WorkspaceDescriptor {
    pub fn none() -> Self {
        Self {
            strategy: WorkspaceStrategy::None,
            path: None,
            cleanup: false,
            container: None,
        }
    }
}

/// Severity of a single task log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub kind: String,
}

/// A resumable snapshot of conversation state taken mid-workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub stage: String,
    pub stage_index: u32,
    pub conversation_state: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// The central unit of work the orchestrator drives to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub acceptance_criteria: Option<String>,
    pub workflow: String,
    pub autonomy: Autonomy,
    pub status: TaskStatus,
    pub priority: Priority,
    pub effort: Effort,
    pub project_path: String,
    pub branch_name: String,
    pub parent_task_id: Option<String>,
    pub subtask_ids: HashSet<String>,
    pub depends_on: HashSet<String>,
    pub blocked_by: HashSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub resume_attempts: u32,
    pub max_resume_attempts: u32,
    pub pause_reason: Option<PauseReason>,
    pub paused_at: Option<i64>,
    pub resume_after: Option<i64>,
    pub usage: Usage,
    pub workspace: Option<WorkspaceDescriptor>,
    pub pr_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub archived_at: Option<i64>,
    pub trashed_at: Option<i64>,
    pub logs: Vec<LogEntry>,
    pub artifacts: Vec<Artifact>,
    pub checkpoints: Vec<Checkpoint>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: String, description: String, workflow: String, project_path: String, branch_name: String) -> Self {
        let now = now_ms();
        Self {
            id,
            description,
            acceptance_criteria: None,
            workflow,
            autonomy: Autonomy::default(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            effort: Effort::default(),
            project_path,
            branch_name,
            parent_task_id: None,
            subtask_ids: HashSet::new(),
            depends_on: HashSet::new(),
            blocked_by: HashSet::new(),
            retry_count: 0,
            max_retries: 3,
            resume_attempts: 0,
            max_resume_attempts: 3,
            pause_reason: None,
            paused_at: None,
            resume_after: None,
            usage: Usage::default(),
            workspace: None,
            pr_url: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            archived_at: None,
            trashed_at: None,
            logs: Vec::new(),
            artifacts: Vec::new(),
            checkpoints: Vec::new(),
            error: None,
        }
    }

    /// `dependsOn` are satisfied only when every listed dependency is itself
    /// `completed`. Callers supply the status lookup so this stays a pure
    /// function over in-memory data.
    pub fn dependencies_satisfied<F>(&self, is_completed: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        self.depends_on.iter().all(|dep| is_completed(dep))
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::Text(self.status.as_str().to_string()));
        fields.insert("priority".to_string(), IndexValue::Text(self.priority.to_string()));
        fields.insert("effort".to_string(), IndexValue::Text(self.effort.to_string()));
        fields.insert("created_at".to_string(), IndexValue::Int(self.created_at));
        fields.insert("project_path".to_string(), IndexValue::Text(self.project_path.clone()));
        fields.insert(
            "parent_task_id".to_string(),
            match &self.parent_task_id {
                Some(p) => IndexValue::Text(p.clone()),
                None => IndexValue::Null,
            },
        );
        fields.insert(
            "trashed".to_string(),
            IndexValue::Bool(self.trashed_at.is_some()),
        );
        fields.insert(
            "archived".to_string(),
            IndexValue::Bool(self.archived_at.is_some()),
        );
        fields.insert(
            "pause_reason".to_string(),
            match &self.pause_reason {
                Some(r) => IndexValue::Text(format!("{r:?}").to_lowercase()),
                None => IndexValue::Null,
            },
        );
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task::new(
            "t1".into(),
            "do the thing".into(),
            "default".into(),
            "/proj".into(),
            "apex/t1".into(),
        )
    }

    #[test]
    fn new_task_defaults_to_pending_normal_medium() {
        let t = sample();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.priority, Priority::Normal);
        assert_eq!(t.effort, Effort::Medium);
        assert_eq!(t.resume_attempts, 0);
    }

    #[test]
    fn status_transitions_match_invariants() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn terminal_statuses_are_completed_failed_cancelled() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn dependencies_satisfied_requires_all_completed() {
        let mut t = sample();
        t.depends_on.insert("a".into());
        t.depends_on.insert("b".into());
        assert!(!t.dependencies_satisfied(|id| id == "a"));
        assert!(t.dependencies_satisfied(|_| true));
    }

    #[test]
    fn auto_resumable_pause_reasons() {
        assert!(PauseReason::SessionLimit.auto_resumable());
        assert!(PauseReason::Capacity.auto_resumable());
        assert!(!PauseReason::Manual.auto_resumable());
        assert!(!PauseReason::Dependency.auto_resumable());
    }

    #[test]
    fn indexed_fields_cover_queue_and_lifecycle_columns() {
        let t = sample();
        let fields = t.indexed_fields();
        assert_eq!(fields.get("status"), Some(&IndexValue::Text("pending".into())));
        assert_eq!(fields.get("priority"), Some(&IndexValue::Text("normal".into())));
        assert_eq!(fields.get("trashed"), Some(&IndexValue::Bool(false)));
    }

    #[test]
    fn record_id_and_collection_name() {
        let t = sample();
        assert_eq!(Record::id(&t), "t1");
        assert_eq!(Task::collection_name(), "tasks");
    }
}
