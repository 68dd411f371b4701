//! Priority and effort tiers used for queue ordering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task priority. Default is `Normal`. Ordering is urgent < high < normal <
/// low so that `Vec::sort` on `Priority` yields admission order directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Priority {
    type Err = ();

    /// Parses a priority string. Unrecognized values normalize to
    /// `Normal` rather than erroring, per the ordering normalization
    /// rules: undefined priority is treated as normal, unknown values
    /// sort after all valid ones.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "urgent" => Priority::Urgent,
            "high" => Priority::High,
            "normal" => Priority::Normal,
            "low" => Priority::Low,
            _ => Priority::Normal,
        })
    }
}

/// Task effort. Default is `Medium`. Ordering is xs < small < medium <
/// large < xl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Xs,
    Small,
    Medium,
    Large,
    Xl,
}

impl Default for Effort {
    fn default() -> Self {
        Effort::Medium
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Effort::Xs => "xs",
            Effort::Small => "small",
            Effort::Medium => "medium",
            Effort::Large => "large",
            Effort::Xl => "xl",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Effort {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "xs" => Effort::Xs,
            "small" => Effort::Small,
            "medium" => Effort::Medium,
            "large" => Effort::Large,
            "xl" => Effort::Xl,
            _ => Effort::Medium,
        })
    }
}

/// The `(priority, effort, createdAt)` tuple used to totally order the
/// pending queue. Two tasks with identical priority and effort tie-break
/// on creation time, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueKey {
    pub priority: Priority,
    pub effort: Effort,
    pub created_at: i64,
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.effort.cmp(&other.effort))
            .then_with(|| self.created_at.cmp(&other.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_urgent_first() {
        let mut ps = vec![Priority::Low, Priority::Urgent, Priority::Normal, Priority::High];
        ps.sort();
        assert_eq!(ps, vec![Priority::Urgent, Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn effort_orders_xs_first() {
        let mut es = vec![Effort::Xl, Effort::Xs, Effort::Medium, Effort::Large, Effort::Small];
        es.sort();
        assert_eq!(
            es,
            vec![Effort::Xs, Effort::Small, Effort::Medium, Effort::Large, Effort::Xl]
        );
    }

    #[test]
    fn unknown_priority_normalizes_to_normal() {
        assert_eq!("bogus".parse::<Priority>().unwrap(), Priority::Normal);
        assert_eq!("".parse::<Priority>().unwrap(), Priority::Normal);
    }

    #[test]
    fn unknown_effort_normalizes_to_medium() {
        assert_eq!("bogus".parse::<Effort>().unwrap(), Effort::Medium);
    }

    #[test]
    fn defaults_match_normalization() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Effort::default(), Effort::Medium);
    }

    #[test]
    fn queue_key_orders_by_priority_then_effort_then_created_at() {
        let a = QueueKey {
            priority: Priority::Urgent,
            effort: Effort::Xs,
            created_at: 100,
        };
        let b = QueueKey {
            priority: Priority::Urgent,
            effort: Effort::Large,
            created_at: 50,
        };
        let c = QueueKey {
            priority: Priority::High,
            effort: Effort::Xs,
            created_at: 1,
        };
        let mut v = vec![c, b, a];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for p in [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low] {
            assert_eq!(p.to_string().parse::<Priority>().unwrap(), p);
        }
    }
}
