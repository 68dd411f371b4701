//! Durable, transactional persistence of tasks, logs, artifacts,
//! checkpoints, idle tasks and thoughts, plus priority-ordered queries.
//!
//! All mutation is serialized through a single actor task (`StoreActor`),
//! matching the single-writer contract: reads and writes alike pass through
//! one `mpsc` channel so the ordering guarantees in the concurrency model
//! hold regardless of how many callers hold a [`StoreHandle`].

pub mod queries;

use taskstore::{Filter, FilterOp, IndexValue, Store};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{new_id, Checkpoint, IdleTask, LogEntry, PauseReason, Priority, Task, TaskStatus, Thought};

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store channel closed: {0}")]
    Channel(String),
}

impl From<taskstore::StoreError> for StoreError {
    fn from(err: taskstore::StoreError) -> Self {
        match err {
            taskstore::StoreError::NotFound(id) => StoreError::NotFound(id),
            taskstore::StoreError::Duplicate(id) => StoreError::Duplicate(id),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filter accepted by [`StoreHandle::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub include_trashed: bool,
    pub include_archived: bool,
    pub order_by_priority: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct IdleTaskFilter {
    pub kind: Option<String>,
    pub priority: Option<Priority>,
    pub implemented: Option<bool>,
    pub limit: Option<usize>,
}

type Reply<T> = oneshot::Sender<StoreResult<T>>;

enum Command {
    CreateTask(Task, Reply<()>),
    GetTask(String, Reply<Option<Task>>),
    UpdateTask(String, serde_json::Value, Reply<Task>),
    UpdateTaskStatus(String, TaskStatus, Option<String>, Reply<Task>),
    ListTasks(TaskFilter, Reply<Vec<Task>>),
    GetAllTasks(Reply<Vec<Task>>),
    GetTasksByStatus(TaskStatus, Reply<Vec<Task>>),
    GetNextQueuedTask(Reply<Option<Task>>),
    GetReadyTasks(Reply<Vec<Task>>),
    GetPendingTasks(Reply<Vec<Task>>),
    GetPausedTasksForResume(Reply<Vec<Task>>),
    FindHighestPriorityParentTask(Reply<Option<Task>>),
    AddLog(String, LogEntry, Reply<()>),
    GetLogs(String, Reply<Vec<LogEntry>>),
    SaveCheckpoint(String, Checkpoint, Reply<String>),
    GetCheckpoint(String, String, Reply<Option<Checkpoint>>),
    GetLatestCheckpoint(String, Reply<Option<Checkpoint>>),
    ListCheckpoints(String, Reply<Vec<Checkpoint>>),
    TrashTask(String, Reply<()>),
    RestoreTask(String, Reply<()>),
    EmptyTrash(Reply<usize>),
    ArchiveTask(String, Reply<()>),
    UnarchiveTask(String, Reply<()>),
    ListArchived(Reply<Vec<Task>>),
    CreateIdleTask(IdleTask, Reply<()>),
    UpdateIdleTask(String, serde_json::Value, Reply<IdleTask>),
    DeleteIdleTask(String, Reply<()>),
    ListIdleTasks(IdleTaskFilter, Reply<Vec<IdleTask>>),
    CreateThought(Thought, Reply<()>),
    SearchThoughts(String, Reply<Vec<Thought>>),
    ListThoughts(Reply<Vec<Thought>>),
    GetLastActivityTime(Reply<i64>),
    Shutdown,
}

/// Cheap, cloneable handle to the running [`StoreActor`].
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
}

macro_rules! call {
    ($self:ident, $variant:ident $(, $arg:expr)*) => {{
        let (tx, rx) = oneshot::channel();
        $self
            .tx
            .send(Command::$variant($($arg,)* tx))
            .await
            .map_err(|_| StoreError::Channel("store actor gone".into()))?;
        rx.await.map_err(|_| StoreError::Channel("store actor dropped reply".into()))?
    }};
}

impl StoreHandle {
    pub async fn create_task(&self, task: Task) -> StoreResult<()> {
        call!(self, CreateTask, task)
    }

    pub async fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        call!(self, GetTask, id.to_string())
    }

    pub async fn update_task(&self, id: &str, patch: serde_json::Value) -> StoreResult<Task> {
        call!(self, UpdateTask, id.to_string(), patch)
    }

    pub async fn update_task_status(&self, id: &str, status: TaskStatus, error: Option<String>) -> StoreResult<Task> {
        call!(self, UpdateTaskStatus, id.to_string(), status, error)
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> StoreResult<Vec<Task>> {
        call!(self, ListTasks, filter)
    }

    pub async fn get_all_tasks(&self) -> StoreResult<Vec<Task>> {
        call!(self, GetAllTasks)
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> StoreResult<Vec<Task>> {
        call!(self, GetTasksByStatus, status)
    }

    pub async fn get_next_queued_task(&self) -> StoreResult<Option<Task>> {
        call!(self, GetNextQueuedTask)
    }

    pub async fn get_ready_tasks(&self) -> StoreResult<Vec<Task>> {
        call!(self, GetReadyTasks)
    }

    pub async fn get_pending_tasks(&self) -> StoreResult<Vec<Task>> {
        call!(self, GetPendingTasks)
    }

    pub async fn get_paused_tasks_for_resume(&self) -> StoreResult<Vec<Task>> {
        call!(self, GetPausedTasksForResume)
    }

    pub async fn find_highest_priority_parent_task(&self) -> StoreResult<Option<Task>> {
        call!(self, FindHighestPriorityParentTask)
    }

    pub async fn add_log(&self, id: &str, entry: LogEntry) -> StoreResult<()> {
        call!(self, AddLog, id.to_string(), entry)
    }

    pub async fn get_logs(&self, id: &str) -> StoreResult<Vec<LogEntry>> {
        call!(self, GetLogs, id.to_string())
    }

    pub async fn save_checkpoint(&self, id: &str, checkpoint: Checkpoint) -> StoreResult<String> {
        call!(self, SaveCheckpoint, id.to_string(), checkpoint)
    }

    pub async fn get_checkpoint(&self, id: &str, checkpoint_id: &str) -> StoreResult<Option<Checkpoint>> {
        call!(self, GetCheckpoint, id.to_string(), checkpoint_id.to_string())
    }

    pub async fn get_latest_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>> {
        call!(self, GetLatestCheckpoint, id.to_string())
    }

    pub async fn list_checkpoints(&self, id: &str) -> StoreResult<Vec<Checkpoint>> {
        call!(self, ListCheckpoints, id.to_string())
    }

    pub async fn trash_task(&self, id: &str) -> StoreResult<()> {
        call!(self, TrashTask, id.to_string())
    }

    pub async fn restore_task(&self, id: &str) -> StoreResult<()> {
        call!(self, RestoreTask, id.to_string())
    }

    pub async fn empty_trash(&self) -> StoreResult<usize> {
        call!(self, EmptyTrash)
    }

    pub async fn archive_task(&self, id: &str) -> StoreResult<()> {
        call!(self, ArchiveTask, id.to_string())
    }

    pub async fn unarchive_task(&self, id: &str) -> StoreResult<()> {
        call!(self, UnarchiveTask, id.to_string())
    }

    pub async fn list_archived(&self) -> StoreResult<Vec<Task>> {
        call!(self, ListArchived)
    }

    pub async fn create_idle_task(&self, task: IdleTask) -> StoreResult<()> {
        call!(self, CreateIdleTask, task)
    }

    pub async fn update_idle_task(&self, id: &str, patch: serde_json::Value) -> StoreResult<IdleTask> {
        call!(self, UpdateIdleTask, id.to_string(), patch)
    }

    pub async fn delete_idle_task(&self, id: &str) -> StoreResult<()> {
        call!(self, DeleteIdleTask, id.to_string())
    }

    pub async fn list_idle_tasks(&self, filter: IdleTaskFilter) -> StoreResult<Vec<IdleTask>> {
        call!(self, ListIdleTasks, filter)
    }

    pub async fn create_thought(&self, thought: Thought) -> StoreResult<()> {
        call!(self, CreateThought, thought)
    }

    pub async fn search_thoughts(&self, query: &str) -> StoreResult<Vec<Thought>> {
        call!(self, SearchThoughts, query.to_string())
    }

    pub async fn list_thoughts(&self) -> StoreResult<Vec<Thought>> {
        call!(self, ListThoughts)
    }

    pub async fn get_last_activity_time(&self) -> StoreResult<i64> {
        call!(self, GetLastActivityTime)
    }

    pub async fn close(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// Owns the three record stores and serializes every mutation received over
/// its command channel onto a single task, matching the Store's "all
/// mutations serialize through a single writer" concurrency contract.
pub struct StoreActor {
    tasks: Store<Task>,
    idle_tasks: Store<IdleTask>,
    thoughts: Store<Thought>,
    last_activity: i64,
}

impl StoreActor {
    /// Opens (or creates) the three collections under `dir` and spawns the
    /// actor loop, returning a cloneable handle to it.
    pub fn spawn(dir: impl Into<std::path::PathBuf>) -> StoreResult<StoreHandle> {
        let dir = dir.into();
        let tasks = Store::<Task>::open(&dir)?;
        let idle_tasks = Store::<IdleTask>::open(&dir)?;
        let thoughts = Store::<Thought>::open(&dir)?;
        let actor = StoreActor {
            tasks,
            idle_tasks,
            thoughts,
            last_activity: taskstore::now_ms(),
        };
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor.run(rx));
        Ok(StoreHandle { tx })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::CreateTask(task, reply) => {
                    let _ = reply.send(self.create_task(task));
                }
                Command::GetTask(id, reply) => {
                    let _ = reply.send(self.get_task(&id));
                }
                Command::UpdateTask(id, patch, reply) => {
                    let _ = reply.send(self.update_task(&id, patch));
                }
                Command::UpdateTaskStatus(id, status, error, reply) => {
                    let _ = reply.send(self.update_task_status(&id, status, error));
                }
                Command::ListTasks(filter, reply) => {
                    let _ = reply.send(self.list_tasks(filter));
                }
                Command::GetAllTasks(reply) => {
                    let _ = reply.send(self.get_all_tasks());
                }
                Command::GetTasksByStatus(status, reply) => {
                    let _ = reply.send(self.get_tasks_by_status(status));
                }
                Command::GetNextQueuedTask(reply) => {
                    let _ = reply.send(self.get_next_queued_task());
                }
                Command::GetReadyTasks(reply) => {
                    let _ = reply.send(self.get_ready_tasks());
                }
                Command::GetPendingTasks(reply) => {
                    let _ = reply.send(self.get_pending_tasks());
                }
                Command::GetPausedTasksForResume(reply) => {
                    let _ = reply.send(self.get_paused_tasks_for_resume());
                }
                Command::FindHighestPriorityParentTask(reply) => {
                    let _ = reply.send(self.find_highest_priority_parent_task());
                }
                Command::AddLog(id, entry, reply) => {
                    let _ = reply.send(self.add_log(&id, entry));
                }
                Command::GetLogs(id, reply) => {
                    let _ = reply.send(self.get_logs(&id));
                }
                Command::SaveCheckpoint(id, ckpt, reply) => {
                    let _ = reply.send(self.save_checkpoint(&id, ckpt));
                }
                Command::GetCheckpoint(id, ckpt_id, reply) => {
                    let _ = reply.send(self.get_checkpoint(&id, &ckpt_id));
                }
                Command::GetLatestCheckpoint(id, reply) => {
                    let _ = reply.send(self.get_latest_checkpoint(&id));
                }
                Command::ListCheckpoints(id, reply) => {
                    let _ = reply.send(self.list_checkpoints(&id));
                }
                Command::TrashTask(id, reply) => {
                    let _ = reply.send(self.trash_task(&id));
                }
                Command::RestoreTask(id, reply) => {
                    let _ = reply.send(self.restore_task(&id));
                }
                Command::EmptyTrash(reply) => {
                    let _ = reply.send(self.empty_trash());
                }
                Command::ArchiveTask(id, reply) => {
                    let _ = reply.send(self.archive_task(&id));
                }
                Command::UnarchiveTask(id, reply) => {
                    let _ = reply.send(self.unarchive_task(&id));
                }
                Command::ListArchived(reply) => {
                    let _ = reply.send(self.list_archived());
                }
                Command::CreateIdleTask(task, reply) => {
                    let _ = reply.send(self.create_idle_task(task));
                }
                Command::UpdateIdleTask(id, patch, reply) => {
                    let _ = reply.send(self.update_idle_task(&id, patch));
                }
                Command::DeleteIdleTask(id, reply) => {
                    let _ = reply.send(self.delete_idle_task(&id));
                }
                Command::ListIdleTasks(filter, reply) => {
                    let _ = reply.send(self.list_idle_tasks(filter));
                }
                Command::CreateThought(thought, reply) => {
                    let _ = reply.send(self.create_thought(thought));
                }
                Command::SearchThoughts(query, reply) => {
                    let _ = reply.send(self.search_thoughts(&query));
                }
                Command::ListThoughts(reply) => {
                    let _ = reply.send(self.list_thoughts());
                }
                Command::GetLastActivityTime(reply) => {
                    let _ = reply.send(Ok(self.last_activity));
                }
                Command::Shutdown => {
                    tracing::info!("store actor shutting down");
                    break;
                }
            }
        }
    }

    fn touch(&mut self) {
        self.last_activity = taskstore::now_ms();
    }

    fn create_task(&mut self, task: Task) -> StoreResult<()> {
        self.tasks.create(task)?;
        self.touch();
        Ok(())
    }

    fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        Ok(self.tasks.get(id)?)
    }

    fn require_task(&self, id: &str) -> StoreResult<Task> {
        self.tasks
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {id} not found")))
    }

    fn update_task(&mut self, id: &str, patch: serde_json::Value) -> StoreResult<Task> {
        let existing = self.require_task(id)?;
        let mut value = serde_json::to_value(&existing).map_err(|e| StoreError::Backend(e.to_string()))?;
        merge_json(&mut value, patch);
        let mut merged: Task = serde_json::from_value(value).map_err(|e| StoreError::Backend(e.to_string()))?;
        merged.updated_at = taskstore::now_ms();
        self.tasks.update(merged.clone())?;
        self.touch();
        Ok(merged)
    }

    fn update_task_status(&mut self, id: &str, status: TaskStatus, error: Option<String>) -> StoreResult<Task> {
        let mut task = self.require_task(id)?;
        if !task.status.can_transition_to(status) {
            return Err(StoreError::IllegalState(format!(
                "cannot transition task {id} from {:?} to {:?}",
                task.status, status
            )));
        }
        task.status = status;
        task.error = error;
        task.updated_at = taskstore::now_ms();
        match status {
            TaskStatus::Completed => {
                task.completed_at = Some(task.updated_at);
                task.resume_attempts = 0;
            }
            TaskStatus::Paused => {
                task.paused_at = Some(task.updated_at);
            }
            TaskStatus::InProgress => {
                task.paused_at = None;
            }
            _ => {}
        }
        self.tasks.update(task.clone())?;
        self.touch();
        Ok(task)
    }

    fn list_tasks(&self, filter: TaskFilter) -> StoreResult<Vec<Task>> {
        let mut tasks = self.tasks.all()?;
        tasks.retain(|t| {
            if !filter.include_trashed && t.trashed_at.is_some() {
                return false;
            }
            if !filter.include_archived && t.archived_at.is_some() {
                return false;
            }
            if let Some(status) = filter.status {
                if t.status != status {
                    return false;
                }
            }
            true
        });
        if filter.order_by_priority {
            queries::sort_by_queue_order(&mut tasks);
        }
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    fn get_all_tasks(&self) -> StoreResult<Vec<Task>> {
        Ok(self.tasks.all()?)
    }

    fn get_tasks_by_status(&self, status: TaskStatus) -> StoreResult<Vec<Task>> {
        let rows = self.tasks.list(&[Filter {
            field: "status".into(),
            op: FilterOp::Eq,
            value: IndexValue::Text(status.as_str().to_string()),
        }])?;
        Ok(rows)
    }

    fn completed_ids(&self) -> StoreResult<std::collections::HashSet<String>> {
        Ok(self
            .tasks
            .list(&[Filter {
                field: "status".into(),
                op: FilterOp::Eq,
                value: IndexValue::Text(TaskStatus::Completed.as_str().to_string()),
            }])?
            .into_iter()
            .map(|t: Task| t.id)
            .collect())
    }

    fn get_next_queued_task(&self) -> StoreResult<Option<Task>> {
        let completed = self.completed_ids()?;
        let pending = self.get_tasks_by_status(TaskStatus::Pending)?;
        let ready = queries::ready_tasks(&pending, |id| completed.contains(id));
        Ok(ready.first().map(|t| (*t).clone()))
    }

    fn get_ready_tasks(&self) -> StoreResult<Vec<Task>> {
        let completed = self.completed_ids()?;
        let pending = self.get_tasks_by_status(TaskStatus::Pending)?;
        Ok(queries::ready_tasks(&pending, |id| completed.contains(id))
            .into_iter()
            .cloned()
            .collect())
    }

    fn get_pending_tasks(&self) -> StoreResult<Vec<Task>> {
        let mut pending = self.get_tasks_by_status(TaskStatus::Pending)?;
        queries::sort_by_queue_order(&mut pending);
        Ok(pending)
    }

    fn get_paused_tasks_for_resume(&self) -> StoreResult<Vec<Task>> {
        let mut paused: Vec<Task> = self
            .get_tasks_by_status(TaskStatus::Paused)?
            .into_iter()
            .filter(|t| matches!(&t.pause_reason, Some(r) if r.auto_resumable()))
            .collect();
        queries::sort_by_queue_order(&mut paused);
        Ok(paused)
    }

    fn find_highest_priority_parent_task(&self) -> StoreResult<Option<Task>> {
        let mut candidates: Vec<Task> = self
            .get_tasks_by_status(TaskStatus::Paused)?
            .into_iter()
            .filter(|t| matches!(&t.pause_reason, Some(r) if r.auto_resumable()) && !t.subtask_ids.is_empty())
            .collect();
        queries::sort_by_queue_order(&mut candidates);
        Ok(candidates.into_iter().next())
    }

    fn add_log(&mut self, id: &str, entry: LogEntry) -> StoreResult<()> {
        let mut task = self.require_task(id)?;
        task.logs.push(entry);
        task.updated_at = taskstore::now_ms();
        self.tasks.update(task)?;
        self.touch();
        Ok(())
    }

    fn get_logs(&self, id: &str) -> StoreResult<Vec<LogEntry>> {
        Ok(self.require_task(id)?.logs)
    }

    fn save_checkpoint(&mut self, id: &str, mut checkpoint: Checkpoint) -> StoreResult<String> {
        let mut task = self.require_task(id)?;
        if checkpoint.id.is_empty() {
            checkpoint.id = new_id();
        }
        let checkpoint_id = checkpoint.id.clone();
        task.checkpoints.push(checkpoint);
        task.updated_at = taskstore::now_ms();
        self.tasks.update(task)?;
        self.touch();
        Ok(checkpoint_id)
    }

    fn get_checkpoint(&self, id: &str, checkpoint_id: &str) -> StoreResult<Option<Checkpoint>> {
        let task = self.require_task(id)?;
        Ok(task.checkpoints.into_iter().find(|c| c.id == checkpoint_id))
    }

    fn get_latest_checkpoint(&self, id: &str) -> StoreResult<Option<Checkpoint>> {
        let task = self.require_task(id)?;
        Ok(task.checkpoints.into_iter().last())
    }

    fn list_checkpoints(&self, id: &str) -> StoreResult<Vec<Checkpoint>> {
        Ok(self.require_task(id)?.checkpoints)
    }

    fn trash_task(&mut self, id: &str) -> StoreResult<()> {
        let mut task = self.require_task(id)?;
        task.trashed_at = Some(taskstore::now_ms());
        task.updated_at = task.trashed_at.unwrap();
        self.tasks.update(task)?;
        self.touch();
        Ok(())
    }

    fn restore_task(&mut self, id: &str) -> StoreResult<()> {
        let mut task = self.require_task(id)?;
        task.trashed_at = None;
        task.updated_at = taskstore::now_ms();
        self.tasks.update(task)?;
        self.touch();
        Ok(())
    }

    fn empty_trash(&mut self) -> StoreResult<usize> {
        let trashed: Vec<Task> = self.tasks.all()?.into_iter().filter(|t| t.trashed_at.is_some()).collect();
        let count = trashed.len();
        for task in trashed {
            self.tasks.remove_from_index(&task.id)?;
        }
        self.touch();
        Ok(count)
    }

    fn archive_task(&mut self, id: &str) -> StoreResult<()> {
        let mut task = self.require_task(id)?;
        if task.status != TaskStatus::Completed {
            return Err(StoreError::IllegalState(format!(
                "task {id} cannot be archived unless completed (status is {:?})",
                task.status
            )));
        }
        task.archived_at = Some(taskstore::now_ms());
        task.updated_at = task.archived_at.unwrap();
        self.tasks.update(task)?;
        self.touch();
        Ok(())
    }

    fn unarchive_task(&mut self, id: &str) -> StoreResult<()> {
        let mut task = self.require_task(id)?;
        task.archived_at = None;
        task.updated_at = taskstore::now_ms();
        self.tasks.update(task)?;
        self.touch();
        Ok(())
    }

    fn list_archived(&self) -> StoreResult<Vec<Task>> {
        Ok(self.tasks.all()?.into_iter().filter(|t| t.archived_at.is_some()).collect())
    }

    fn create_idle_task(&mut self, task: IdleTask) -> StoreResult<()> {
        self.idle_tasks.create(task)?;
        self.touch();
        Ok(())
    }

    fn update_idle_task(&mut self, id: &str, patch: serde_json::Value) -> StoreResult<IdleTask> {
        let existing = self
            .idle_tasks
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(format!("idle task {id} not found")))?;
        let mut value = serde_json::to_value(&existing).map_err(|e| StoreError::Backend(e.to_string()))?;
        merge_json(&mut value, patch);
        let mut merged: IdleTask = serde_json::from_value(value).map_err(|e| StoreError::Backend(e.to_string()))?;
        merged.updated_at = taskstore::now_ms();
        self.idle_tasks.update(merged.clone())?;
        self.touch();
        Ok(merged)
    }

    fn delete_idle_task(&mut self, id: &str) -> StoreResult<()> {
        self.idle_tasks.remove_from_index(id)?;
        self.touch();
        Ok(())
    }

    fn list_idle_tasks(&self, filter: IdleTaskFilter) -> StoreResult<Vec<IdleTask>> {
        let mut tasks = self.idle_tasks.all()?;
        tasks.retain(|t| {
            if let Some(kind) = &filter.kind {
                if &t.kind != kind {
                    return false;
                }
            }
            if let Some(priority) = filter.priority {
                if t.priority != priority {
                    return false;
                }
            }
            if let Some(implemented) = filter.implemented {
                if t.implemented != implemented {
                    return false;
                }
            }
            true
        });
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    fn create_thought(&mut self, thought: Thought) -> StoreResult<()> {
        self.thoughts.create(thought)?;
        self.touch();
        Ok(())
    }

    fn search_thoughts(&self, query: &str) -> StoreResult<Vec<Thought>> {
        Ok(self.thoughts.all()?.into_iter().filter(|t| t.matches(query)).collect())
    }

    fn list_thoughts(&self) -> StoreResult<Vec<Thought>> {
        Ok(self.thoughts.all()?)
    }
}

/// Shallow top-level merge: keys present in `patch` overwrite `base`; keys
/// absent from `patch` are left untouched. Matches the contract "merges
/// fields" without requiring a hand-written patch struct per record kind.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    if let (Some(base_obj), serde_json::Value::Object(patch_obj)) = (base.as_object_mut(), patch) {
        for (key, value) in patch_obj {
            base_obj.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn handle() -> (TempDir, StoreHandle) {
        let dir = TempDir::new().unwrap();
        let handle = StoreActor::spawn(dir.path()).unwrap();
        (dir, handle)
    }

    fn task(id: &str) -> Task {
        Task::new(id.into(), "desc".into(), "default".into(), "/proj".into(), "b".into())
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        let got = handle.get_task("t1").await.unwrap().unwrap();
        assert_eq!(got.id, "t1");
    }

    #[tokio::test]
    async fn create_duplicate_fails() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        let err = handle.create_task(task("t1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn update_task_merges_fields() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        let patch = serde_json::json!({ "description": "new desc" });
        let updated = handle.update_task("t1", patch).await.unwrap();
        assert_eq!(updated.description, "new desc");
        assert_eq!(updated.id, "t1");
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let (_dir, handle) = handle().await;
        let err = handle.update_task("missing", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn illegal_status_transition_rejected() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        let err = handle
            .update_task_status("t1", TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(_)));
    }

    #[tokio::test]
    async fn completed_transition_resets_resume_attempts() {
        let (_dir, handle) = handle().await;
        let mut t = task("t1");
        t.resume_attempts = 2;
        handle.create_task(t).await.unwrap();
        handle.update_task_status("t1", TaskStatus::InProgress, None).await.unwrap();
        let completed = handle
            .update_task_status("t1", TaskStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(completed.resume_attempts, 0);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn archive_requires_completed_status() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        let err = handle.archive_task("t1").await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(_)));
        handle.update_task_status("t1", TaskStatus::InProgress, None).await.unwrap();
        handle.update_task_status("t1", TaskStatus::Completed, None).await.unwrap();
        handle.archive_task("t1").await.unwrap();
        let archived = handle.list_archived().await.unwrap();
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn archive_then_unarchive_restores_fields_except_archived_at() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        handle.update_task_status("t1", TaskStatus::InProgress, None).await.unwrap();
        let completed = handle.update_task_status("t1", TaskStatus::Completed, None).await.unwrap();
        handle.archive_task("t1").await.unwrap();
        handle.unarchive_task("t1").await.unwrap();
        let restored = handle.get_task("t1").await.unwrap().unwrap();
        assert_eq!(restored.status, completed.status);
        assert_eq!(restored.logs, completed.logs);
        assert!(restored.archived_at.is_none());
    }

    #[tokio::test]
    async fn trash_then_restore_is_identity_modulo_trashed_at() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        handle.trash_task("t1").await.unwrap();
        let trashed = handle.get_task("t1").await.unwrap().unwrap();
        assert!(trashed.trashed_at.is_some());
        handle.restore_task("t1").await.unwrap();
        let restored = handle.get_task("t1").await.unwrap().unwrap();
        assert!(restored.trashed_at.is_none());
        assert_eq!(restored.description, trashed.description);
    }

    #[tokio::test]
    async fn empty_trash_removes_only_trashed_tasks() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        handle.create_task(task("t2")).await.unwrap();
        handle.trash_task("t1").await.unwrap();
        let removed = handle.empty_trash().await.unwrap();
        assert_eq!(removed, 1);
        assert!(handle.get_task("t1").await.unwrap().is_none());
        assert!(handle.get_task("t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_checkpoint_then_get_checkpoint_round_trips() {
        let (_dir, handle) = handle().await;
        handle.create_task(task("t1")).await.unwrap();
        let ckpt = Checkpoint {
            id: String::new(),
            stage: "implementation".into(),
            stage_index: 1,
            conversation_state: serde_json::json!({"messages": ["hi"]}),
            metadata: serde_json::json!({"pauseReason": "session_limit"}),
            created_at: taskstore::now_ms(),
        };
        let id = handle.save_checkpoint("t1", ckpt.clone()).await.unwrap();
        let fetched = handle.get_checkpoint("t1", &id).await.unwrap().unwrap();
        assert_eq!(fetched.conversation_state, ckpt.conversation_state);
        let latest = handle.get_latest_checkpoint("t1").await.unwrap().unwrap();
        assert_eq!(latest.id, id);
    }

    #[tokio::test]
    async fn get_next_queued_task_honors_priority_ordering() {
        let (_dir, handle) = handle().await;
        let mut low = task("low");
        low.priority = Priority::Low;
        low.created_at = 1;
        let mut urgent = task("urgent");
        urgent.priority = Priority::Urgent;
        urgent.created_at = 2;
        handle.create_task(low).await.unwrap();
        handle.create_task(urgent).await.unwrap();
        let next = handle.get_next_queued_task().await.unwrap().unwrap();
        assert_eq!(next.id, "urgent");
    }

    #[tokio::test]
    async fn get_next_queued_task_skips_unsatisfied_dependencies() {
        let (_dir, handle) = handle().await;
        let mut blocked = task("blocked");
        blocked.priority = Priority::Urgent;
        blocked.depends_on.insert("dep".into());
        let free = task("free");
        handle.create_task(blocked).await.unwrap();
        handle.create_task(free).await.unwrap();
        let next = handle.get_next_queued_task().await.unwrap().unwrap();
        assert_eq!(next.id, "free");
    }

    #[tokio::test]
    async fn capture_thought_then_list_contains_it() {
        let (_dir, handle) = handle().await;
        handle.create_thought(Thought::new("th1".into(), "remember to cache".into())).await.unwrap();
        let found = handle.search_thoughts("cache").await.unwrap();
        assert_eq!(found.len(), 1);
        let all = handle.list_thoughts().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn idle_task_crud() {
        let (_dir, handle) = handle().await;
        let idle = IdleTask::new("i1".into(), "title".into(), "desc".into(), "bug".into(), Priority::High);
        handle.create_idle_task(idle).await.unwrap();
        let updated = handle
            .update_idle_task("i1", serde_json::json!({"implemented": true}))
            .await
            .unwrap();
        assert!(updated.implemented);
        let listed = handle
            .list_idle_tasks(IdleTaskFilter {
                implemented: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        handle.delete_idle_task("i1").await.unwrap();
        let listed = handle.list_idle_tasks(IdleTaskFilter::default()).await.unwrap();
        assert!(listed.is_empty());
    }
}
