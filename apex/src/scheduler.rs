//! Pure pause/resume decision function over current usage and time window.

use serde::{Deserialize, Serialize};

use crate::usage::{CurrentUsage, Mode, UsageAccounter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindowStatus {
    pub mode: Mode,
    pub is_active: bool,
    pub next_transition: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityStatus {
    pub current_percentage: f64,
    pub threshold: f64,
    pub should_pause: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseDecision {
    pub should_pause: bool,
    pub reason: Option<String>,
    pub time_window: TimeWindowStatus,
    pub capacity: CapacityStatus,
    pub recommendations: Vec<String>,
    pub next_reset_time: i64,
}

/// Evaluates the current usage snapshot against the configured daily budget
/// and time-window/capacity rules. First matching rule wins, per §4.C.
pub fn should_pause_tasks(accounter: &UsageAccounter) -> PauseDecision {
    let usage: CurrentUsage = accounter.get_current_usage();
    let config = accounter.config();

    let is_off_hours = usage.current_mode == Mode::OffHours;
    let time_window = TimeWindowStatus {
        mode: usage.current_mode,
        is_active: !is_off_hours,
        next_transition: usage.next_mode_switch,
    };

    let percentage = if config.daily_budget > 0.0 {
        usage.daily_usage.total_cost / config.daily_budget
    } else {
        0.0
    };
    let threshold = usage.thresholds.capacity_threshold;
    let capacity = CapacityStatus {
        current_percentage: percentage,
        threshold,
        should_pause: percentage > threshold,
    };

    let next_reset_time = accounter.next_midnight();
    let mut recommendations = Vec::new();

    if usage.daily_usage.total_cost > config.daily_budget {
        recommendations.push("wait for the daily budget to reset at midnight".to_string());
        return PauseDecision {
            should_pause: true,
            reason: Some("Daily budget exceeded".to_string()),
            time_window,
            capacity,
            recommendations,
            next_reset_time,
        };
    }

    if is_off_hours && config.time_based_enabled {
        recommendations.push("wait for the active time window to resume".to_string());
        return PauseDecision {
            should_pause: true,
            reason: Some("Outside active time window (off-hours)".to_string()),
            time_window,
            capacity,
            recommendations,
            next_reset_time,
        };
    }

    if capacity.should_pause {
        let reason = format!(
            "Capacity threshold exceeded ({:.0}% >= {:.0}%)",
            percentage * 100.0,
            threshold * 100.0
        );
        recommendations.push("reduce concurrent task load or raise the capacity threshold".to_string());
        return PauseDecision {
            should_pause: true,
            reason: Some(reason),
            time_window,
            capacity,
            recommendations,
            next_reset_time,
        };
    }

    PauseDecision {
        should_pause: false,
        reason: None,
        time_window,
        capacity,
        recommendations,
        next_reset_time,
    }
}

/// Tracks the Runner's last-seen pause state so edge-triggered
/// `daemon:paused`/`daemon:resumed` events are emitted exactly once per
/// transition, suppressing duplicate edges (§4.C hysteresis).
#[derive(Debug, Default)]
pub struct PauseEdgeDetector {
    paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseEdge {
    None,
    JustPaused,
    JustResumed,
}

impl PauseEdgeDetector {
    pub fn observe(&mut self, should_pause: bool) -> PauseEdge {
        let edge = match (self.paused, should_pause) {
            (false, true) => PauseEdge::JustPaused,
            (true, false) => PauseEdge::JustResumed,
            _ => PauseEdge::None,
        };
        self.paused = should_pause;
        edge
    }
}
