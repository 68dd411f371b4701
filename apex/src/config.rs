//! Daemon configuration types and the standalone-binary loading fallback
//! chain (`--config` path, project-local `.apex/config.yaml`, user config
//! directory, then built-in defaults).

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::health::WatchdogConfig;
use crate::usage::UsageConfig;
use crate::workspace::WorkspaceConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub usage: UsageConfig,
    pub runner: RunnerConfig,
    pub workspace: WorkspaceConfig,
    pub workflow: WorkflowConfig,
    pub hooks: HooksConfig,
    pub watchdog: WatchdogConfig,
}

impl Config {
    /// `--config` path, else `<projectPath>/.apex/config.yaml`, else
    /// `$XDG_CONFIG_HOME/apex/config.yaml`, else defaults.
    pub fn load(config_path: Option<&PathBuf>, project_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        if let Some(project_path) = project_path {
            let local_config = project_path.join(".apex").join("config.yaml");
            if local_config.exists() {
                match Self::load_from_file(&local_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                    }
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("apex").join("config.yaml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Overlays a pre-serialized JSON payload (from `APEX_CONFIG_JSON`) on
    /// top of an already-loaded config, bypassing the file read entirely
    /// when the whole document is supplied this way.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).context("Failed to parse APEX_CONFIG_JSON payload")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,
    #[serde(rename = "base-url")]
    pub base_url: String,
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Runner poll-loop timing and concurrency caps. `pollIntervalMs` is
/// clamped into `[min_poll_ms, max_poll_ms]` at every read, so a malformed
/// value never crashes startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
    #[serde(rename = "min-poll-ms")]
    pub min_poll_ms: u64,
    #[serde(rename = "max-poll-ms")]
    pub max_poll_ms: u64,
    #[serde(rename = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: u64,
}

impl RunnerConfig {
    pub fn clamped_poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.clamp(self.min_poll_ms, self.max_poll_ms)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            min_poll_ms: 1_000,
            max_poll_ms: 60_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    #[serde(rename = "max-turns")]
    pub max_turns: u32,
    #[serde(rename = "session-limit-utilization")]
    pub session_limit_utilization: f64,
    /// The external provider's context window, used by `detectSessionLimit`
    /// to compute `utilization`. Defaults to Claude's 200k-token window.
    #[serde(rename = "context-window-tokens")]
    pub context_window_tokens: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_turns: 200,
            session_limit_utilization: 0.85,
            context_window_tokens: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.runner.min_poll_ms, 1_000);
        assert_eq!(config.runner.max_poll_ms, 60_000);
    }

    #[test]
    fn poll_interval_clamps_out_of_range_values() {
        let mut runner = RunnerConfig::default();
        runner.poll_interval_ms = 0;
        assert_eq!(runner.clamped_poll_interval_ms(), 1_000);
        runner.poll_interval_ms = 999_999_999;
        assert_eq!(runner.clamped_poll_interval_ms(), 60_000);
    }

    #[test]
    fn partial_yaml_falls_back_to_field_defaults() {
        let yaml = "llm:\n  model: claude-haiku\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.model, "claude-haiku");
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.runner.poll_interval_ms, 5_000);
    }

    #[test]
    fn unknown_keys_are_ignored_not_fatal() {
        let yaml = "mystery-field: 42\nllm:\n  provider: anthropic\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.provider, "anthropic");
    }

    #[test]
    fn from_json_round_trips_through_apex_config_json() {
        let config = Config::default();
        let payload = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&payload).unwrap();
        assert_eq!(parsed.llm.model, config.llm.model);
    }
}
