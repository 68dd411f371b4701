//! The event stream the Orchestrator façade pushes to any subscriber.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::{PauseReason, Usage};
use crate::llm::TokenUsage;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ApexEvent {
    #[serde(rename = "task:created")]
    TaskCreated { task_id: String },
    #[serde(rename = "task:started")]
    TaskStarted { task_id: String },
    #[serde(rename = "task:stage-changed")]
    TaskStageChanged { task_id: String, stage: String },
    #[serde(rename = "task:completed")]
    TaskCompleted { task_id: String },
    #[serde(rename = "task:failed")]
    TaskFailed { task_id: String, error: String },
    #[serde(rename = "task:paused")]
    TaskPaused { task_id: String, reason: PauseReason },
    #[serde(rename = "task:resumed")]
    TaskResumed { task_id: String },

    #[serde(rename = "agent:message")]
    AgentMessage { task_id: String, message: String },
    #[serde(rename = "agent:thinking")]
    AgentThinking { task_id: String, agent: String, text: String },
    #[serde(rename = "agent:tool-use")]
    AgentToolUse { task_id: String, tool: String, input: serde_json::Value },

    #[serde(rename = "usage:updated")]
    UsageUpdated { task_id: String, usage: Usage, token_usage: TokenUsage },

    #[serde(rename = "daemon:paused")]
    DaemonPaused { reason: String },
    #[serde(rename = "daemon:resumed")]
    DaemonResumed,

    #[serde(rename = "worktree:created")]
    WorktreeCreated { task_id: String, path: String },
    #[serde(rename = "worktree:cleaned")]
    WorktreeCleaned { task_id: String, path: String },
    #[serde(rename = "worktree:merge-cleaned")]
    WorktreeMergeCleaned { task_id: String, path: String, pr_url: String },
}

/// Thin wrapper over a broadcast channel: publishing never blocks and never
/// fails just because nobody happens to be listening right now.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ApexEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApexEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ApexEvent) {
        // No subscribers is a normal state (e.g. headless runs); dropping
        // the event is correct, not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(ApexEvent::TaskCreated { task_id: "t1".into() });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, ApexEvent::TaskCreated { task_id } if task_id == "t1"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(ApexEvent::DaemonResumed);
    }
}
