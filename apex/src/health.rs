//! Health check counters, bounded restart history, and watchdog policy.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartRecord {
    pub timestamp: i64,
    pub reason: String,
    pub exit_code: Option<i32>,
    pub triggered_by_watchdog: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub uptime_ms: i64,
    pub memory_bytes: Option<u64>,
    pub restart_history: Vec<RestartRecord>,
}

/// Watchdog configuration: how long to wait before a restart, how many
/// restarts are tolerated in a rolling window before giving up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub restart_delay_ms: u64,
    pub max_restarts: u32,
    pub restart_window_ms: i64,
    pub max_history: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_delay_ms: 2_000,
            max_restarts: 5,
            restart_window_ms: 600_000,
            max_history: 1000,
        }
    }
}

struct Counters {
    passed: u64,
    failed: u64,
}

/// Tracks the daemon's own liveness over time, independent of any single
/// task's outcome. Every getter returns an owned copy; the ring is never
/// shared mutably with callers.
pub struct Watchdog {
    config: WatchdogConfig,
    started_at: i64,
    counters: Mutex<Counters>,
    restart_history: Mutex<VecDeque<RestartRecord>>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            started_at: taskstore::now_ms(),
            counters: Mutex::new(Counters { passed: 0, failed: 0 }),
            restart_history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn perform_health_check(&self, pass: bool) {
        let mut counters = self.counters.lock().unwrap();
        if pass {
            counters.passed += 1;
        } else {
            counters.failed += 1;
        }
    }

    pub fn record_restart(&self, reason: impl Into<String>, exit_code: Option<i32>, triggered_by_watchdog: bool) {
        if self.config.max_history == 0 {
            return;
        }
        let mut history = self.restart_history.lock().unwrap();
        history.push_back(RestartRecord {
            timestamp: taskstore::now_ms(),
            reason: reason.into(),
            exit_code,
            triggered_by_watchdog,
        });
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    pub fn clear_restart_history(&self) {
        self.restart_history.lock().unwrap().clear();
    }

    /// Whether restarts within the configured window have exceeded
    /// `max_restarts`, meaning the daemon should stop trying and enter a
    /// terminal crash-looping state instead of restarting again.
    pub fn is_crash_looping(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = taskstore::now_ms();
        let history = self.restart_history.lock().unwrap();
        let recent = history
            .iter()
            .filter(|r| now - r.timestamp <= self.config.restart_window_ms)
            .count();
        recent as u32 > self.config.max_restarts
    }

    pub fn get_health_report(&self) -> HealthReport {
        let counters = self.counters.lock().unwrap();
        let history = self.restart_history.lock().unwrap();
        HealthReport {
            health_checks_passed: counters.passed,
            health_checks_failed: counters.failed,
            uptime_ms: taskstore::now_ms() - self.started_at,
            memory_bytes: current_memory_usage(),
            restart_history: history.iter().cloned().collect(),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }
}

/// Best-effort process RSS snapshot; `None` on platforms without a cheap
/// read (avoids pulling in a full system-info crate for one counter).
fn current_memory_usage() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
