//! Per-task and per-day token/cost accounting, time-window mode resolution,
//! and budget threshold evaluation.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::domain::Usage;

/// A resolved time-of-day operating mode, each with its own resource caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Day,
    Night,
    OffHours,
}

/// Per-mode resource caps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeLimits {
    pub max_tokens_per_task: u64,
    pub max_cost_per_task: f64,
    pub max_concurrent_tasks: u32,
    pub capacity_threshold: f64,
}

impl Default for ModeLimits {
    fn default() -> Self {
        Self {
            max_tokens_per_task: 200_000,
            max_cost_per_task: 10.0,
            max_concurrent_tasks: 5,
            capacity_threshold: 0.8,
        }
    }
}

/// Configuration consumed by the accounter: the hour sets that define
/// day/night, each mode's limits, and the daily budget ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub day_mode_hours: Vec<u32>,
    pub night_mode_hours: Vec<u32>,
    pub day: ModeLimits,
    pub night: ModeLimits,
    pub off_hours: ModeLimits,
    pub daily_budget: f64,
    pub time_based_enabled: bool,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            day_mode_hours: (8..20).collect(),
            night_mode_hours: (20..24).chain(0..8).collect(),
            day: ModeLimits::default(),
            night: ModeLimits {
                max_concurrent_tasks: 10,
                ..ModeLimits::default()
            },
            off_hours: ModeLimits {
                max_concurrent_tasks: 0,
                ..ModeLimits::default()
            },
            daily_budget: 100.0,
            time_based_enabled: true,
        }
    }
}

impl UsageConfig {
    fn mode_for_hour(&self, hour: u32) -> Mode {
        if self.day_mode_hours.contains(&hour) {
            Mode::Day
        } else if self.night_mode_hours.contains(&hour) {
            Mode::Night
        } else {
            Mode::OffHours
        }
    }

    pub fn limits_for(&self, mode: Mode) -> ModeLimits {
        match mode {
            Mode::Day => self.day,
            Mode::Night => self.night,
            Mode::OffHours => self.off_hours,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyUsage {
    pub total_tokens: u64,
    pub total_cost: f64,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    started_at: i64,
}

#[derive(Debug, Clone)]
pub struct CurrentUsage {
    pub daily_usage: DailyUsage,
    pub current_mode: Mode,
    pub thresholds: ModeLimits,
    pub next_mode_switch: i64,
}

#[derive(Debug, Clone)]
pub struct StartDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

/// Tracks daily and per-task usage and answers admission questions the
/// scheduler and workflow engine depend on. All counters live behind a
/// single mutex per group, per the "updated under a mutex per counter
/// group" concurrency note.
pub struct UsageAccounter {
    config: UsageConfig,
    daily: Mutex<DailyUsage>,
    active: Mutex<HashMap<String, InFlight>>,
}

impl UsageAccounter {
    pub fn new(config: UsageConfig) -> Self {
        Self {
            config,
            daily: Mutex::new(DailyUsage::default()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn track_task_start(&self, task_id: &str) {
        self.active.lock().unwrap().insert(
            task_id.to_string(),
            InFlight {
                started_at: taskstore::now_ms(),
            },
        );
    }

    pub fn track_task_completion(&self, task_id: &str, usage: Usage, success: bool) {
        self.active.lock().unwrap().remove(task_id);
        let mut daily = self.daily.lock().unwrap();
        daily.total_tokens += usage.total_tokens;
        daily.total_cost += usage.estimated_cost;
        if success {
            daily.tasks_completed += 1;
        } else {
            daily.tasks_failed += 1;
        }
    }

    pub fn reset_daily_stats(&self) {
        *self.daily.lock().unwrap() = DailyUsage::default();
    }

    fn current_mode(&self) -> Mode {
        self.config.mode_for_hour(Local::now().hour())
    }

    /// Next wall-clock timestamp (ms) where the hour crosses a day/night
    /// boundary.
    fn next_mode_switch(&self) -> i64 {
        let now = Local::now();
        let mut candidate = now.date_naive().and_time(NaiveTime::from_hms_opt(now.hour(), 0, 0).unwrap());
        let current = self.current_mode();
        loop {
            candidate += chrono::Duration::hours(1);
            let hour = candidate.and_utc().hour();
            if self.config.mode_for_hour(hour) != current {
                return candidate.and_utc().timestamp_millis();
            }
            // Safety valve: a pathological all-one-mode config still
            // terminates after a full day.
            if candidate - now.naive_local() > chrono::Duration::hours(25) {
                return candidate.and_utc().timestamp_millis();
            }
        }
    }

    /// The next local midnight, used to schedule `reset_daily_stats`.
    pub fn next_midnight(&self) -> i64 {
        let now = Local::now();
        let tomorrow = now.date_naive().succ_opt().unwrap();
        tomorrow
            .and_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap())
            .and_local_timezone(Local)
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| now.timestamp_millis() + 86_400_000)
    }

    pub fn get_current_usage(&self) -> CurrentUsage {
        let mode = self.current_mode();
        CurrentUsage {
            daily_usage: self.daily.lock().unwrap().clone(),
            current_mode: mode,
            thresholds: self.config.limits_for(mode),
            next_mode_switch: self.next_mode_switch(),
        }
    }

    /// Allowed iff the resulting daily cost stays within budget and current
    /// usage is within the active mode's capacity threshold. Comparisons
    /// use closed upper bounds (`<=`).
    pub fn can_start_task(&self, estimated_cost: f64) -> StartDecision {
        let daily = self.daily.lock().unwrap();
        let projected = daily.total_cost + estimated_cost;
        if projected > self.config.daily_budget {
            return StartDecision {
                allowed: false,
                reason: Some(format!(
                    "projected daily cost {projected:.2} exceeds budget {:.2}",
                    self.config.daily_budget
                )),
            };
        }
        let mode = self.current_mode();
        let limits = self.config.limits_for(mode);
        let percentage = if self.config.daily_budget > 0.0 {
            daily.total_cost / self.config.daily_budget
        } else {
            0.0
        };
        if percentage > limits.capacity_threshold {
            return StartDecision {
                allowed: false,
                reason: Some(format!(
                    "capacity threshold exceeded ({:.0}% >= {:.0}%)",
                    percentage * 100.0,
                    limits.capacity_threshold * 100.0
                )),
            };
        }
        StartDecision { allowed: true, reason: None }
    }

    pub fn get_base_limits(&self) -> ModeLimits {
        self.config.limits_for(self.current_mode())
    }

    pub fn get_active_tasks(&self) -> Vec<String> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    pub fn config(&self) -> &UsageConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounter() -> UsageAccounter {
        UsageAccounter::new(UsageConfig {
            daily_budget: 100.0,
            day: ModeLimits {
                capacity_threshold: 0.70,
                ..ModeLimits::default()
            },
            ..UsageConfig::default()
        })
    }

    #[test]
    fn s2_auto_pause_resume_at_capacity() {
        let acc = accounter();
        acc.track_task_start("t1");
        acc.track_task_completion(
            "t1",
            Usage {
                estimated_cost: 65.0,
                ..Default::default()
            },
            true,
        );
        let decision = acc.can_start_task(0.0);
        assert!(decision.allowed);

        acc.track_task_start("t2");
        acc.track_task_completion(
            "t2",
            Usage {
                estimated_cost: 10.0,
                ..Default::default()
            },
            true,
        );
        let decision = acc.can_start_task(0.0);
        assert!(!decision.allowed);
        let reason = decision.reason.unwrap();
        assert!(reason.contains("75"));
        assert!(reason.contains("70"));

        acc.reset_daily_stats();
        assert!(acc.can_start_task(0.0).allowed);
    }

    #[test]
    fn daily_budget_exceeded_blocks_regardless_of_threshold() {
        let acc = UsageAccounter::new(UsageConfig {
            daily_budget: 50.0,
            ..UsageConfig::default()
        });
        let decision = acc.can_start_task(51.0);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("budget"));
    }

    #[test]
    fn track_completion_updates_counters_and_clears_in_flight() {
        let acc = accounter();
        acc.track_task_start("t1");
        assert_eq!(acc.get_active_tasks(), vec!["t1".to_string()]);
        acc.track_task_completion(
            "t1",
            Usage {
                total_tokens: 500,
                estimated_cost: 1.0,
                ..Default::default()
            },
            false,
        );
        assert!(acc.get_active_tasks().is_empty());
        let usage = acc.get_current_usage();
        assert_eq!(usage.daily_usage.total_tokens, 500);
        assert_eq!(usage.daily_usage.tasks_failed, 1);
        assert_eq!(usage.daily_usage.tasks_completed, 0);
    }

    #[test]
    fn mode_for_hour_resolves_day_night_off_hours() {
        let config = UsageConfig {
            day_mode_hours: vec![9, 10, 11],
            night_mode_hours: vec![22, 23],
            ..UsageConfig::default()
        };
        assert_eq!(config.mode_for_hour(10), Mode::Day);
        assert_eq!(config.mode_for_hour(23), Mode::Night);
        assert_eq!(config.mode_for_hour(3), Mode::OffHours);
    }
}
