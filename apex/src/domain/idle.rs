//! Idle-time-analyzer-produced task suggestions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, now_ms};

use super::priority::Priority;

/// A candidate task surfaced by an external idle-time analyzer, pending a
/// human or automated decision to implement it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub kind: String,
    pub priority: Priority,
    pub implemented: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl IdleTask {
    pub fn new(id: String, title: String, description: String, kind: String, priority: Priority) -> Self {
        let now = now_ms();
        Self {
            id,
            title,
            description,
            kind,
            priority,
            implemented: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for IdleTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn collection_name() -> &'static str {
        "idle_tasks"
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("kind".to_string(), IndexValue::Text(self.kind.clone()));
        fields.insert("priority".to_string(), IndexValue::Text(self.priority.to_string()));
        fields.insert("implemented".to_string(), IndexValue::Bool(self.implemented));
        fields.insert("created_at".to_string(), IndexValue::Int(self.created_at));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_idle_task_is_unimplemented() {
        let t = IdleTask::new("i1".into(), "title".into(), "desc".into(), "refactor".into(), Priority::Low);
        assert!(!t.implemented);
        assert_eq!(t.created_at, t.updated_at);
    }

    #[test]
    fn indexed_fields_include_kind_and_implemented() {
        let t = IdleTask::new("i1".into(), "t".into(), "d".into(), "bug".into(), Priority::High);
        let fields = t.indexed_fields();
        assert_eq!(fields.get("kind"), Some(&IndexValue::Text("bug".into())));
        assert_eq!(fields.get("implemented"), Some(&IndexValue::Bool(false)));
    }
}
