//! PreToolUse/PostToolUse interception: dangerous-pattern denial, risky-
//! pattern warnings, sensitive-path auditing, and custom regex hooks.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    ":(){:|:&};:",
    "mkfs",
    "dd if=/dev/zero of=/dev/sd",
    "dd if=/dev/random of=/dev/sd",
    "drop table",
    "drop database",
    "truncate table",
    "chmod -r 777 /",
    "> /dev/sda",
    "setenforce 0",
];

const RISKY_PATTERNS: &[&str] = &["sudo ", "chmod ", "chown ", "rm -rf ", "push --force", "push -f", "reset --hard"];

const SENSITIVE_PATH_PATTERNS: &[&str] =
    &["/etc/passwd", "/etc/shadow", ".ssh/", "id_rsa", "id_ed25519", ".env", "credentials", ".pem"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPoint {
    PreToolUse,
    PostToolUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    Allow,
    Deny,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRule {
    pub tool: String,
    pub action: HookAction,
    pub pattern: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

/// Intercepts every tool call the workflow engine routes through it.
/// Built-in rules run first; a deny from any source dominates regardless
/// of what later rules say.
pub struct HookGateway {
    custom_rules: Vec<HookRule>,
    timeout_ms: u64,
}

impl HookGateway {
    pub fn new(timeout_ms: u64) -> Self {
        Self { custom_rules: Vec::new(), timeout_ms }
    }

    pub fn register(&mut self, rule: HookRule) {
        self.custom_rules.push(rule);
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Evaluates a `PreToolUse` call. `tool` is the tool name, `input` is
    /// its serialized argument payload.
    pub fn pre_tool_use(&self, task_id: &str, tool: &str, input: &str) -> Decision {
        let lower = input.to_lowercase();

        for pattern in DANGEROUS_PATTERNS {
            if lower.contains(pattern) {
                warn!(task_id, tool, pattern, "blocked dangerous tool call");
                return Decision::Deny(format!("blocked: input matches dangerous pattern \"{pattern}\""));
            }
        }

        for rule in &self.custom_rules {
            if rule.tool != tool && rule.tool != "*" {
                continue;
            }
            let matches = match &rule.pattern {
                Some(pattern) => Regex::new(pattern).map(|re| re.is_match(input)).unwrap_or(false),
                None => true,
            };
            if !matches {
                continue;
            }
            match rule.action {
                HookAction::Deny => {
                    let message = rule.message.clone().unwrap_or_else(|| "denied by custom hook".to_string());
                    warn!(task_id, tool, "custom hook denied tool call");
                    return Decision::Deny(message);
                }
                HookAction::Warn => {
                    warn!(task_id, tool, message = rule.message.as_deref().unwrap_or(""), "custom hook warning");
                }
                HookAction::Allow => {}
            }
        }

        for pattern in RISKY_PATTERNS {
            if lower.contains(pattern) {
                warn!(task_id, tool, pattern, "risky tool call allowed with warning");
            }
        }

        for pattern in SENSITIVE_PATH_PATTERNS {
            if lower.contains(pattern) {
                warn!(task_id, tool, pattern, "tool call touches a sensitive path");
            }
        }

        let summary = truncate(input, 200);
        debug!(task_id, tool, summary, "tool invocation");

        Decision::Allow
    }

    /// `PostToolUse` currently only logs; kept as a distinct hook point so
    /// future custom rules can observe tool output.
    pub fn post_tool_use(&self, task_id: &str, tool: &str, output: &str) {
        let summary = truncate(output, 200);
        debug!(task_id, tool, summary, "tool completed");
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangerous_pattern_is_denied() {
        let gateway = HookGateway::new(5_000);
        let decision = gateway.pre_tool_use("t1", "bash", "rm -rf /");
        assert!(matches!(decision, Decision::Deny(_)));
    }

    #[test]
    fn dangerous_pattern_dominates_custom_allow_rule() {
        let mut gateway = HookGateway::new(5_000);
        gateway.register(HookRule {
            tool: "bash".to_string(),
            action: HookAction::Allow,
            pattern: None,
            message: None,
        });
        let decision = gateway.pre_tool_use("t1", "bash", "sudo rm -rf / --no-preserve-root");
        assert!(matches!(decision, Decision::Deny(_)));
    }

    #[test]
    fn risky_pattern_is_allowed_but_logged() {
        let gateway = HookGateway::new(5_000);
        let decision = gateway.pre_tool_use("t1", "bash", "sudo apt-get update");
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn custom_deny_rule_matches_regex_pattern() {
        let mut gateway = HookGateway::new(5_000);
        gateway.register(HookRule {
            tool: "edit".to_string(),
            action: HookAction::Deny,
            pattern: Some(r"production\.yaml".to_string()),
            message: Some("editing production config is not allowed".to_string()),
        });
        let decision = gateway.pre_tool_use("t1", "edit", "{\"path\":\"config/production.yaml\"}");
        assert_eq!(decision, Decision::Deny("editing production config is not allowed".to_string()));
    }

    #[test]
    fn custom_rule_for_different_tool_does_not_apply() {
        let mut gateway = HookGateway::new(5_000);
        gateway.register(HookRule {
            tool: "edit".to_string(),
            action: HookAction::Deny,
            pattern: None,
            message: None,
        });
        let decision = gateway.pre_tool_use("t1", "bash", "echo hi");
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn truncate_respects_200_char_limit() {
        let long_input = "a".repeat(500);
        let summary = truncate(&long_input, 200);
        assert_eq!(summary.chars().count(), 201);
    }

    #[test]
    fn sensitive_path_is_allowed_but_audited() {
        let gateway = HookGateway::new(5_000);
        let decision = gateway.pre_tool_use("t1", "write", "{\"path\":\"/home/user/.ssh/id_rsa\"}");
        assert_eq!(decision, Decision::Allow);
    }
}
