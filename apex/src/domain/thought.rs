//! Free-form captured thoughts that can later be promoted into tasks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, now_ms};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    pub id: String,
    pub text: String,
    pub created_at: i64,
    pub implemented: bool,
}

impl Thought {
    pub fn new(id: String, text: String) -> Self {
        Self {
            id,
            text,
            created_at: now_ms(),
            implemented: false,
        }
    }

    pub fn matches(&self, query: &str) -> bool {
        self.text.to_lowercase().contains(&query.to_lowercase())
    }
}

impl Record for Thought {
    fn id(&self) -> &str {
        &self.id
    }

    fn collection_name() -> &'static str {
        "thoughts"
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("implemented".to_string(), IndexValue::Bool(self.implemented));
        fields.insert("created_at".to_string(), IndexValue::Int(self.created_at));
        fields
    }
}
