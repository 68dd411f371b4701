//! Drives a task's stage DAG to completion (or to a checkpointed pause)
//! against an external LLM provider, with HookGateway interception and
//! UsageAccounter enforcement on every turn.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use taskstore::now_ms;
use thiserror::Error;
use tracing::{debug, warn};

use super::stage::{detect_session_limit, SessionRecommendation, StageDefinition, WorkflowDefinition};
use crate::domain::{new_id, Checkpoint, PauseReason, Task, TaskStatus, Usage};
use crate::error::ApexError;
use crate::events::{ApexEvent, EventBus};
use crate::hooks::{Decision, HookGateway};
use crate::llm::{CompletionRequest, ContentBlock, LlmClient, Message, StopReason, ToolCall};
use crate::store::StoreHandle;
use crate::usage::UsageAccounter;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),
    #[error("checkpoint not found for task '{0}'")]
    CheckpointNotFound(String),
}

/// Runs a single tool call and returns its result content. Real tool
/// execution (the sandboxed shell/file operations an agent invokes) is an
/// external collaborator; this trait is the seam the engine calls through
/// once the HookGateway has allowed a call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, task_id: &str, call: &ToolCall) -> String;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ConversationState {
    messages: Vec<Message>,
}

pub struct WorkflowEngine {
    store: StoreHandle,
    llm: Arc<dyn LlmClient>,
    tool_executor: Arc<dyn ToolExecutor>,
    hooks: HookGateway,
    usage: Arc<UsageAccounter>,
    events: EventBus,
    workflows: HashMap<String, WorkflowDefinition>,
    max_turns: u32,
    session_limit_utilization: f64,
    context_window_tokens: u64,
    model: String,
    handlebars: Handlebars<'static>,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StoreHandle,
        llm: Arc<dyn LlmClient>,
        tool_executor: Arc<dyn ToolExecutor>,
        hooks: HookGateway,
        usage: Arc<UsageAccounter>,
        events: EventBus,
        max_turns: u32,
        session_limit_utilization: f64,
        context_window_tokens: u64,
        model: String,
    ) -> Self {
        Self {
            store,
            llm,
            tool_executor,
            hooks,
            usage,
            events,
            workflows: HashMap::new(),
            max_turns,
            session_limit_utilization,
            context_window_tokens,
            model,
            handlebars: Handlebars::new(),
        }
    }

    /// Validates the stage DAG (cycle/unknown-dependency rejection) before
    /// accepting the definition.
    pub fn register_workflow(&mut self, definition: WorkflowDefinition) -> Result<(), ApexError> {
        definition.topological_order()?;
        self.workflows.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn has_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Runs a task from its first stage. Intended for tasks entering
    /// `in-progress` for the first time; use [`Self::resume_task`] for
    /// continuing a paused task.
    pub async fn execute_task(&self, task_id: &str) -> Result<(), ApexError> {
        let mut task = self.fetch_task(task_id).await?;
        let definition = self.lookup_workflow(&task.workflow)?;
        let order = definition.topological_order()?;

        self.store.update_task_status(task_id, TaskStatus::InProgress, None).await?;
        self.events.publish(ApexEvent::TaskStarted { task_id: task_id.to_string() });

        self.run_stages(&mut task, definition, &order, 0, Vec::new()).await
    }

    /// `resumeTask`: increments `resumeAttempts` before re-entering the
    /// agent loop (so a crash mid-resume never under-counts), restores
    /// `conversationState` from the named or latest checkpoint, and
    /// continues from that checkpoint's stage.
    pub async fn resume_task(&self, task_id: &str, checkpoint_id: Option<&str>) -> Result<(), ApexError> {
        let task = self.fetch_task(task_id).await?;

        if task.resume_attempts >= task.max_resume_attempts {
            let message = format!(
                "resume attempts {0}/{1} reached max_resume_attempts {1}; manual review required",
                task.resume_attempts, task.max_resume_attempts
            );
            self.store.update_task_status(task_id, TaskStatus::Failed, Some(message.clone())).await?;
            self.events.publish(ApexEvent::TaskFailed { task_id: task_id.to_string(), error: message.clone() });
            return Err(ApexError::IllegalState { message });
        }

        let patch = serde_json::json!({ "resume_attempts": task.resume_attempts + 1 });
        let mut task = self.store.update_task(task_id, patch).await?;

        let checkpoint = match checkpoint_id {
            Some(id) => self.store.get_checkpoint(task_id, id).await?,
            None => self.store.get_latest_checkpoint(task_id).await?,
        }
        .ok_or_else(|| WorkflowError::CheckpointNotFound(task_id.to_string()))
        .map_err(|e| ApexError::NotFound { message: e.to_string() })?;

        let definition = self.lookup_workflow(&task.workflow)?;
        let order = definition.topological_order()?;
        let start_index = order.iter().position(|name| name == &checkpoint.stage).unwrap_or(0);

        let conversation: ConversationState = serde_json::from_value(checkpoint.conversation_state.clone())
            .unwrap_or_default();

        self.store.update_task_status(task_id, TaskStatus::InProgress, None).await?;
        self.events.publish(ApexEvent::TaskResumed { task_id: task_id.to_string() });

        self.run_stages(&mut task, definition, &order, start_index, conversation.messages).await
    }

    /// `mergeTaskBranch` call-through; kept here so callers don't need to
    /// reach past the engine into the workspace module directly.
    pub async fn merge_task_branch(
        &self,
        project_path: &std::path::Path,
        branch_name: &str,
        options: &crate::workspace::MergeOptions,
    ) -> crate::workspace::MergeResult {
        crate::workspace::merge_task_branch(project_path, branch_name, options).await
    }

    async fn fetch_task(&self, task_id: &str) -> Result<Task, ApexError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ApexError::NotFound { message: format!("task '{task_id}' not found") })
    }

    fn lookup_workflow(&self, name: &str) -> Result<&WorkflowDefinition, ApexError> {
        self.workflows
            .get(name)
            .ok_or_else(|| ApexError::Configuration { message: WorkflowError::UnknownWorkflow(name.to_string()).to_string() })
    }

    async fn run_stages(
        &self,
        task: &mut Task,
        definition: &WorkflowDefinition,
        order: &[String],
        start_index: usize,
        resumed_messages: Vec<Message>,
    ) -> Result<(), ApexError> {
        let mut messages = resumed_messages;

        for (index, stage_name) in order.iter().enumerate().skip(start_index) {
            let stage = definition
                .stage(stage_name)
                .expect("topological_order only ever names stages present in the definition");

            self.events
                .publish(ApexEvent::TaskStageChanged { task_id: task.id.clone(), stage: stage.name.clone() });

            // A fresh stage (no carried conversation) starts from its own prompt.
            if messages.is_empty() {
                let prompt = self.render_prompt(definition, stage, task);
                messages.push(Message::user(prompt));
            }

            match self.run_stage(task, stage, index, &mut messages).await {
                Ok(()) => {
                    messages.clear();
                }
                Err(ApexError::SessionLimitReached { .. }) => return Ok(()),
                Err(e) => {
                    self.store.update_task_status(&task.id, TaskStatus::Failed, Some(e.to_string())).await?;
                    self.events.publish(ApexEvent::TaskFailed { task_id: task.id.clone(), error: e.to_string() });
                    return Err(e);
                }
            }
        }

        if self.has_non_terminal_subtasks(task).await? {
            let patch = serde_json::json!({ "pause_reason": "dependency", "paused_at": now_ms() });
            self.store.update_task(&task.id, patch).await?;
            self.store.update_task_status(&task.id, TaskStatus::Paused, None).await?;
            self.events
                .publish(ApexEvent::TaskPaused { task_id: task.id.clone(), reason: PauseReason::Dependency });
            return Ok(());
        }

        let patch = serde_json::json!({ "resume_attempts": 0, "completed_at": now_ms() });
        self.store.update_task(&task.id, patch).await?;
        self.store.update_task_status(&task.id, TaskStatus::Completed, None).await?;
        self.events.publish(ApexEvent::TaskCompleted { task_id: task.id.clone() });
        Ok(())
    }

    /// A parent task may not enter `completed` while any subtask it spawned
    /// is still running.
    async fn has_non_terminal_subtasks(&self, task: &Task) -> Result<bool, ApexError> {
        for child_id in &task.subtask_ids {
            if let Some(child) = self.store.get_task(child_id).await? {
                if !child.status.is_terminal() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn render_prompt(&self, definition: &WorkflowDefinition, stage: &StageDefinition, task: &Task) -> String {
        let context = serde_json::json!({
            "task": task,
            "stage": stage.name,
            "workflow": definition.name,
        });
        self.handlebars
            .render_template(&stage.prompt_template, &context)
            .unwrap_or_else(|e| {
                warn!(task_id = %task.id, stage = %stage.name, error = %e, "prompt template render failed, using raw template");
                stage.prompt_template.clone()
            })
    }

    async fn run_stage(
        &self,
        task: &mut Task,
        stage: &StageDefinition,
        stage_index: usize,
        messages: &mut Vec<Message>,
    ) -> Result<(), ApexError> {
        let mut turn: u32 = 0;

        loop {
            turn += 1;
            if turn > self.max_turns {
                return Err(ApexError::IllegalState {
                    message: format!("stage '{}' exceeded max_turns ({})", stage.name, self.max_turns),
                });
            }

            let session_status = detect_session_limit(
                task.usage.total_tokens,
                self.context_window_tokens,
                self.session_limit_utilization,
            );

            if session_status.near_limit
                && matches!(session_status.recommendation, SessionRecommendation::Checkpoint | SessionRecommendation::Handoff)
            {
                self.checkpoint_for_session_limit(task, stage, stage_index, messages, &session_status).await?;
                return Err(ApexError::SessionLimitReached {
                    message: format!(
                        "stage '{}' paused at {:.0}% of the context window",
                        stage.name,
                        session_status.utilization * 100.0
                    ),
                });
            }

            let request = CompletionRequest {
                system_prompt: format!("You are the '{}' agent for apex workflow stage '{}'.", stage.agent, stage.name),
                messages: messages.clone(),
                tools: Vec::new(),
                max_tokens: 8192,
            };

            let response = self
                .llm
                .complete(request)
                .await
                .map_err(|e| ApexError::ExternalProvider { message: e.to_string() })?;

            if let Some(thinking) = &response.thinking {
                let trimmed = thinking.trim();
                if !trimmed.is_empty() {
                    self.events.publish(ApexEvent::AgentThinking {
                        task_id: task.id.clone(),
                        agent: stage.agent.clone(),
                        text: trimmed.to_string(),
                    });
                    debug!(task_id = %task.id, agent = %stage.agent, thinking = %truncate(trimmed, 200), "agent thinking");
                }
            }

            if let Some(text) = &response.content {
                self.events.publish(ApexEvent::AgentMessage { task_id: task.id.clone(), message: text.clone() });
                self.store
                    .add_log(
                        &task.id,
                        crate::domain::LogEntry {
                            level: crate::domain::LogLevel::Info,
                            message: text.clone(),
                            metadata: serde_json::Value::Null,
                            timestamp: now_ms(),
                        },
                    )
                    .await?;
            }

            task.usage.input_tokens += response.usage.input_tokens;
            task.usage.output_tokens += response.usage.output_tokens;
            task.usage.total_tokens += response.usage.input_tokens + response.usage.output_tokens;
            task.usage.estimated_cost += response.usage.cost_usd(&self.model);
            self.events.publish(ApexEvent::UsageUpdated {
                task_id: task.id.clone(),
                usage: task.usage,
                token_usage: response.usage.clone(),
            });

            let max_cost_per_task = self.usage.get_current_usage().thresholds.max_cost_per_task;
            if task.usage.estimated_cost > max_cost_per_task {
                self.checkpoint_budget_exceeded(task, stage, stage_index, messages).await?;
                return Err(ApexError::BudgetExceeded {
                    message: format!(
                        "task '{}' exceeded max_cost_per_task (${:.2} > ${:.2})",
                        task.id, task.usage.estimated_cost, max_cost_per_task
                    ),
                });
            }

            let assistant_message = build_assistant_message(&response);
            messages.push(assistant_message);

            match response.stop_reason {
                StopReason::EndTurn | StopReason::StopSequence => break,
                StopReason::MaxTokens => {
                    messages.push(Message::user("Continue from where you left off; the previous response was truncated."));
                }
                StopReason::ToolUse => {
                    let results = self.handle_tool_calls(task, &response.tool_calls).await?;
                    messages.push(Message::user_blocks(results));
                }
            }
        }

        let patch = serde_json::json!({ "usage": task.usage, "updated_at": now_ms() });
        self.store.update_task(&task.id, patch).await?;
        Ok(())
    }

    async fn handle_tool_calls(&self, task: &Task, calls: &[ToolCall]) -> Result<Vec<ContentBlock>, ApexError> {
        let mut blocks = Vec::with_capacity(calls.len());

        for call in calls {
            let input = call.input.to_string();
            self.events.publish(ApexEvent::AgentToolUse {
                task_id: task.id.clone(),
                tool: call.name.clone(),
                input: call.input.clone(),
            });

            let decision = self.hooks.pre_tool_use(&task.id, &call.name, &input);
            match decision {
                Decision::Deny(reason) => {
                    blocks.push(ContentBlock::tool_result(&call.id, &reason, true));
                }
                Decision::Allow if call.name == "spawn_subtask" => {
                    let result = self.spawn_subtask(task, &call.input).await;
                    match result {
                        Ok(child_id) => blocks.push(ContentBlock::tool_result(&call.id, &format!("subtask '{child_id}' created"), false)),
                        Err(e) => blocks.push(ContentBlock::tool_result(&call.id, &e.to_string(), true)),
                    }
                }
                Decision::Allow => {
                    let output = self.tool_executor.execute(&task.id, call).await;
                    self.hooks.post_tool_use(&task.id, &call.name, &output);
                    blocks.push(ContentBlock::tool_result(&call.id, &output, false));
                }
            }
        }

        Ok(blocks)
    }

    /// Realizes the `spawn_subtask` cascade: creates a child `Task` sharing
    /// `projectPath`, linked via `parentTaskId`/`subtaskIds`.
    async fn spawn_subtask(&self, parent: &Task, input: &serde_json::Value) -> Result<String, ApexError> {
        let description = input
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("subtask")
            .to_string();
        let workflow = input.get("workflow").and_then(|v| v.as_str()).unwrap_or(&parent.workflow).to_string();

        let child_id = new_id();
        let branch_name = format!("{}/subtask-{}", parent.branch_name, &child_id[..8.min(child_id.len())]);
        let mut child = Task::new(child_id.clone(), description, workflow, parent.project_path.clone(), branch_name);
        child.parent_task_id = Some(parent.id.clone());

        self.store.create_task(child).await?;

        let mut subtask_ids = parent.subtask_ids.clone();
        subtask_ids.insert(child_id.clone());
        let patch = serde_json::json!({ "subtask_ids": subtask_ids });
        self.store.update_task(&parent.id, patch).await?;

        Ok(child_id)
    }

    async fn checkpoint_for_session_limit(
        &self,
        task: &mut Task,
        stage: &StageDefinition,
        stage_index: usize,
        messages: &[Message],
        status: &super::stage::SessionLimitStatus,
    ) -> Result<(), ApexError> {
        let checkpoint = Checkpoint {
            id: new_id(),
            stage: stage.name.clone(),
            stage_index: stage_index as u32,
            conversation_state: serde_json::to_value(ConversationState { messages: messages.to_vec() })
                .unwrap_or(serde_json::Value::Null),
            metadata: serde_json::json!({
                "pauseReason": "session_limit",
                "resumePoint": "stage_start",
                "sessionLimitStatus": status,
            }),
            created_at: now_ms(),
        };
        self.store.save_checkpoint(&task.id, checkpoint).await?;

        let patch = serde_json::json!({ "pause_reason": "session_limit", "paused_at": now_ms() });
        self.store.update_task(&task.id, patch).await?;
        self.store.update_task_status(&task.id, TaskStatus::Paused, None).await?;
        task.status = TaskStatus::Paused;

        self.events
            .publish(ApexEvent::TaskPaused { task_id: task.id.clone(), reason: PauseReason::SessionLimit });
        Ok(())
    }

    async fn checkpoint_budget_exceeded(
        &self,
        task: &Task,
        stage: &StageDefinition,
        stage_index: usize,
        messages: &[Message],
    ) -> Result<(), ApexError> {
        let checkpoint = Checkpoint {
            id: new_id(),
            stage: stage.name.clone(),
            stage_index: stage_index as u32,
            conversation_state: serde_json::to_value(ConversationState { messages: messages.to_vec() })
                .unwrap_or(serde_json::Value::Null),
            metadata: serde_json::json!({ "pauseReason": "budget" }),
            created_at: now_ms(),
        };
        self.store.save_checkpoint(&task.id, checkpoint).await?;
        Ok(())
    }
}

fn build_assistant_message(response: &crate::llm::CompletionResponse) -> Message {
    let mut blocks = Vec::new();
    if let Some(thinking) = &response.thinking {
        blocks.push(ContentBlock::Thinking { thinking: thinking.clone() });
    }
    if let Some(text) = &response.content {
        blocks.push(ContentBlock::text(text));
    }
    for call in &response.tool_calls {
        blocks.push(ContentBlock::ToolUse { id: call.id.clone(), name: call.name.clone(), input: call.input.clone() });
    }
    Message::assistant_blocks(blocks)
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        let mut truncated: String = input.chars().take(max_chars).collect();
        truncated.push('\u{2026}');
        truncated
    }
}
