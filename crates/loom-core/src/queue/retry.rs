//! Retry policy: operator retry selection and liveness-reclaim backoff.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TaskId;

/// Which failed tasks an operator retry targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrySelection {
    /// Exactly these tasks (ignored unless `broken` or `error`).
    Ids(Vec<TaskId>),

    /// Every failed task of one function.
    Function(String),

    /// Every failed task.
    AllFailed,
}

/// What happens to dependents of a retried task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryCascade {
    /// Only the selected tasks are re-armed; dependents stay broken.
    #[default]
    None,

    /// Dependents broken with `upstream_dependency_failed` are re-armed too,
    /// transitively.
    Propagated,
}

impl std::str::FromStr for RetryCascade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RetryCascade::None),
            "propagated" => Ok(RetryCascade::Propagated),
            other => Err(format!("unknown retry cascade {other:?}")),
        }
    }
}

/// Reclaim policy for tasks whose worker stopped heart-beating.
#[derive(Debug, Clone)]
pub struct ReclaimPolicy {
    /// On this many crashes the task is marked `error` instead of requeued.
    pub max_attempts: u32,

    /// Base delay for the first requeue.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl ReclaimPolicy {
    /// Calculate delay before the task may be claimed again.
    ///
    /// `crashes` counts reclaims of the task, this one included (1-indexed).
    /// Deferrals and ordinary claims do not count.
    /// delay = base_delay * multiplier^(crashes - 1)
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - crash 1: 2s
    /// - crash 2: 4s
    /// - crash 3: 8s
    pub fn next_delay(&self, crashes: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = crashes.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if delay_secs.is_finite() && delay_secs >= 0.0 {
            Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        }
    }

    /// Earliest time a task reclaimed at `now` for the `crashes`-th time may run again.
    pub fn not_before(&self, crashes: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.next_delay(crashes))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .map_or_else(latest_representable, |t| t.min(latest_representable()))
    }

    /// Has a task reclaimed for the `crashes`-th time used up its budget?
    pub fn is_exhausted(&self, crashes: u32) -> bool {
        crashes >= self.max_attempts
    }
}

// Four-digit years keep stored RFC 3339 timestamps comparable as text.
fn latest_representable() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of one reclaim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Put back to `pending` with a backoff.
    pub requeued: Vec<TaskId>,

    /// Marked `error` after too many crashes.
    pub exhausted: Vec<TaskId>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty()
    }
}
