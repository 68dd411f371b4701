//! Workflow definitions: a stage DAG, topological ordering, and the
//! session-limit heuristic that decides when a stage must checkpoint.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ApexError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub agent: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub prompt_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl WorkflowDefinition {
    /// Computes a topological order over stages. Rejects the definition at
    /// load time if the dependency graph contains a cycle or references an
    /// unknown stage name.
    pub fn topological_order(&self) -> Result<Vec<String>, ApexError> {
        let names: HashSet<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        for stage in &self.stages {
            for dep in &stage.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(ApexError::Configuration {
                        message: format!("stage '{}' depends on unknown stage '{dep}'", stage.name),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for stage in &self.stages {
            in_degree.entry(stage.name.as_str()).or_insert(0);
            for dep in &stage.dependencies {
                *in_degree.entry(stage.name.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(stage.name.as_str());
            }
        }

        let mut ready: Vec<&str> =
            in_degree.iter().filter(|(_, deg)| **deg == 0).map(|(name, _)| *name).collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(name) = ready.pop() {
            order.push(name.to_string());
            if let Some(deps) = dependents.get(name) {
                let mut newly_ready = Vec::new();
                for dependent in deps {
                    let degree = in_degree.get_mut(dependent).expect("dependent tracked in in_degree");
                    *degree -= 1;
                    if *degree == 0 {
                        newly_ready.push(*dependent);
                    }
                }
                newly_ready.sort();
                ready.extend(newly_ready);
                ready.sort();
            }
        }

        if order.len() != self.stages.len() {
            return Err(ApexError::Configuration {
                message: format!("workflow '{}' has a cycle in its stage dependencies", self.name),
            });
        }

        Ok(order)
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Recommendation returned by `detect_session_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecommendation {
    Continue,
    Checkpoint,
    Handoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimitStatus {
    pub near_limit: bool,
    pub current_tokens: u64,
    pub utilization: f64,
    pub recommendation: SessionRecommendation,
}

/// Estimates whether a conversation is close enough to the model's context
/// window that the stage should checkpoint rather than keep going.
/// `max_turns` stands in for a hard context budget (turns, not tokens,
/// since the conversation shape isn't known at this layer); `current_tokens`
/// is whatever the caller has accumulated from `TokenUsage` so far.
pub fn detect_session_limit(current_tokens: u64, context_window_tokens: u64, utilization_threshold: f64) -> SessionLimitStatus {
    let utilization = if context_window_tokens == 0 {
        0.0
    } else {
        current_tokens as f64 / context_window_tokens as f64
    };

    let near_limit = utilization >= utilization_threshold;
    let recommendation = if !near_limit {
        SessionRecommendation::Continue
    } else if utilization >= 0.97 {
        SessionRecommendation::Handoff
    } else {
        SessionRecommendation::Checkpoint
    };

    SessionLimitStatus { near_limit, current_tokens, utilization, recommendation }
}
