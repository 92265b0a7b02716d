//! Status - 進捗と ETA の見積もり
//!
//! TaskStore の集計行（`StatsRows`）から `StatsSnapshot` を作る純粋関数群。
//! 見積もりは報告用の近似値であり、スケジューリングの判断には使わない。
//!
//! # 計算
//! - rate = 直近ウィンドウで終了した件数 / ウィンドウ秒数
//! - fill = 平均所要時間 × rate × 100（その関数がワーカーを占有している割合）
//! - eta = pending 件数 / rate（rate が 0 なら省略）
//! - 全体 ETA = 関数ごとの ETA の合計 × 2（後段は前段に供給されるため保守的に）

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;
use crate::ports::{ErrorTypeCount, StatsRows};

/// Key the stats loop stores its latest snapshot under.
pub const STATS_KEY: &str = "stats";

/// Per-function row of the task matrix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub counts: BTreeMap<TaskStatus, u64>,

    /// Tasks finished inside the window.
    pub recent_count: u64,
    pub recent_avg_duration_secs: Option<f64>,
    pub recent_fill_pct: Option<f64>,

    /// Omitted when nothing finished inside the window.
    pub eta_secs: Option<u64>,
}

impl FunctionStats {
    pub fn count(&self, status: TaskStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Finished per second over the window.
    pub fn rate(&self, window: Duration) -> f64 {
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.recent_count as f64 / secs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub window_secs: u64,
    pub task_matrix: BTreeMap<String, FunctionStats>,
    pub totals: BTreeMap<TaskStatus, u64>,
    pub total: u64,
    pub eta_secs: Option<u64>,
    pub progress_str: String,
    pub db_size: Option<u64>,
    pub top_error_types: Vec<ErrorTypeCount>,
}

impl StatsSnapshot {
    pub fn total_of(&self, status: TaskStatus) -> u64 {
        self.totals.get(&status).copied().unwrap_or(0)
    }

    /// (success + broken + error) / total, in percent.
    pub fn progress_pct(&self) -> f64 {
        percent(
            self.total_of(TaskStatus::Success)
                + self.total_of(TaskStatus::Broken)
                + self.total_of(TaskStatus::Error),
            self.total,
        )
    }

    /// (broken + error) / total, in percent.
    pub fn error_pct(&self) -> f64 {
        percent(
            self.total_of(TaskStatus::Broken) + self.total_of(TaskStatus::Error),
            self.total,
        )
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * part as f64 / total as f64
}

/// Build a snapshot from raw store aggregates.
pub fn estimate(
    rows: StatsRows,
    window: Duration,
    top_error_types: usize,
    now: DateTime<Utc>,
) -> StatsSnapshot {
    let mut matrix: BTreeMap<String, FunctionStats> = BTreeMap::new();
    let mut totals: BTreeMap<TaskStatus, u64> = BTreeMap::new();

    for bucket in rows.counts {
        *totals.entry(bucket.status).or_default() += bucket.count;
        *matrix
            .entry(bucket.function)
            .or_default()
            .counts
            .entry(bucket.status)
            .or_default() += bucket.count;
    }

    for recent in rows.recent {
        let row = matrix.entry(recent.function).or_default();
        row.recent_count = recent.count;
        if recent.count == 0 {
            continue;
        }

        let avg = recent.total_duration_secs / recent.count as f64;
        let rate = row.rate(window);
        row.recent_avg_duration_secs = Some(avg);
        row.recent_fill_pct = Some(avg * rate * 100.0);
        if rate > 0.0 {
            row.eta_secs = Some((row.count(TaskStatus::Pending) as f64 / rate) as u64);
        }
    }

    let eta_secs = aggregate_eta(matrix.values());
    let total = totals.values().sum();
    let mut top = rows.error_types;
    top.truncate(top_error_types);

    let mut snapshot = StatsSnapshot {
        taken_at: now,
        window_secs: window.as_secs(),
        task_matrix: matrix,
        totals,
        total,
        eta_secs,
        progress_str: String::new(),
        db_size: rows.storage_bytes,
        top_error_types: top,
    };
    snapshot.progress_str = progress_str(&snapshot);
    snapshot
}

/// Sum of per-function ETAs, doubled. `None` if no function has one.
fn aggregate_eta<'a>(rows: impl Iterator<Item = &'a FunctionStats>) -> Option<u64> {
    let mut sum: Option<u64> = None;
    for eta in rows.filter_map(|r| r.eta_secs) {
        sum = Some(sum.unwrap_or(0).saturating_add(eta));
    }
    sum.map(|s| s.saturating_mul(2))
}

/// `"42% processed, 1.50% errors, ETA: 0:03:20"`, or `"empty"`.
pub fn progress_str(snapshot: &StatsSnapshot) -> String {
    if snapshot.total == 0 {
        return "empty".to_string();
    }

    let mut out = format!("{}% processed", snapshot.progress_pct().trunc() as u64);
    let errors = snapshot.total_of(TaskStatus::Broken) + snapshot.total_of(TaskStatus::Error);
    if errors > 0 {
        let _ = write!(out, ", {:.2}% errors", snapshot.error_pct());
    }
    if let Some(eta) = snapshot.eta_secs
        && eta > 1
    {
        let _ = write!(out, ", ETA: {}", format_eta(eta));
    }
    out
}

/// `H:MM:SS`, prefixed with `N day(s), ` past 24 hours.
pub fn format_eta(secs: u64) -> String {
    let days = secs / 86_400;
    let rest = secs % 86_400;
    let clock = format!("{}:{:02}:{:02}", rest / 3600, (rest % 3600) / 60, rest % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{RecentRow, StatusCount};
    use rstest::rstest;

    const WINDOW: Duration = Duration::from_secs(300);

    fn count(function: &str, status: TaskStatus, count: u64) -> StatusCount {
        StatusCount {
            function: function.into(),
            status,
            count,
        }
    }

    fn recent(function: &str, count: u64, total_duration_secs: f64) -> RecentRow {
        RecentRow {
            function: function.into(),
            count,
            total_duration_secs,
        }
    }

    fn rows_with_pending(pending: u64, finished_in_window: u64) -> StatsRows {
        StatsRows {
            counts: vec![
                count("convert", TaskStatus::Pending, pending),
                count("convert", TaskStatus::Success, 100),
            ],
            recent: vec![recent("convert", finished_in_window, finished_in_window as f64 * 2.0)],
            ..Default::default()
        }
    }

    #[test]
    fn rate_fill_and_eta_per_function() {
        let snapshot = estimate(rows_with_pending(60, 30), WINDOW, 10, Utc::now());
        let row = &snapshot.task_matrix["convert"];

        // 30 finished in 300s -> 0.1/s; 60 pending -> 600s.
        assert_eq!(row.recent_count, 30);
        assert_eq!(row.recent_avg_duration_secs, Some(2.0));
        assert!((row.recent_fill_pct.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(row.eta_secs, Some(600));
        assert_eq!(snapshot.eta_secs, Some(1200));
    }

    #[test]
    fn eta_is_omitted_without_recent_completions() {
        let rows = StatsRows {
            counts: vec![count("convert", TaskStatus::Pending, 10)],
            ..Default::default()
        };
        let snapshot = estimate(rows, WINDOW, 10, Utc::now());
        assert_eq!(snapshot.task_matrix["convert"].eta_secs, None);
        assert_eq!(snapshot.eta_secs, None);
        assert_eq!(snapshot.progress_str, "0% processed");
    }

    #[test]
    fn eta_shrinks_as_pending_drains() {
        let etas: Vec<u64> = [90, 60, 30, 0]
            .into_iter()
            .map(|pending| {
                estimate(rows_with_pending(pending, 30), WINDOW, 10, Utc::now())
                    .eta_secs
                    .unwrap()
            })
            .collect();
        assert!(etas.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(etas.last(), Some(&0));
    }

    #[test]
    fn progress_and_error_percentages() {
        let rows = StatsRows {
            counts: vec![
                count("extract", TaskStatus::Success, 6),
                count("extract", TaskStatus::Error, 1),
                count("convert", TaskStatus::Broken, 1),
                count("convert", TaskStatus::Pending, 2),
            ],
            ..Default::default()
        };
        let snapshot = estimate(rows, WINDOW, 10, Utc::now());
        assert_eq!(snapshot.total, 10);
        assert!((snapshot.progress_pct() - 80.0).abs() < 1e-9);
        assert!((snapshot.error_pct() - 20.0).abs() < 1e-9);
        assert_eq!(snapshot.progress_str, "80% processed, 20.00% errors");
    }

    #[test]
    fn empty_store() {
        let snapshot = estimate(StatsRows::default(), WINDOW, 10, Utc::now());
        assert_eq!(snapshot.progress_str, "empty");
        assert!(snapshot.task_matrix.is_empty());
    }

    #[test]
    fn top_error_types_are_capped() {
        let rows = StatsRows {
            error_types: (0..5)
                .map(|i| ErrorTypeCount {
                    function: "f".into(),
                    error_type: format!("E{i}"),
                    count: 10 - i,
                })
                .collect(),
            ..Default::default()
        };
        let snapshot = estimate(rows, WINDOW, 3, Utc::now());
        assert_eq!(snapshot.top_error_types.len(), 3);
        assert_eq!(snapshot.top_error_types[0].error_type, "E0");
    }

    #[test]
    fn snapshot_survives_json() {
        let snapshot = estimate(rows_with_pending(10, 5), WINDOW, 10, Utc::now());
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["task_matrix"]["convert"]["counts"]["pending"], 10);
        let back: StatsSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back.totals, snapshot.totals);
        assert_eq!(back.eta_secs, snapshot.eta_secs);
        assert_eq!(back.progress_str, snapshot.progress_str);
    }

    #[rstest]
    #[case(0, "0:00:00")]
    #[case(59, "0:00:59")]
    #[case(3_600, "1:00:00")]
    #[case(86_399, "23:59:59")]
    #[case(86_400, "1 day, 0:00:00")]
    #[case(2 * 86_400 + 61, "2 days, 0:01:01")]
    fn eta_formatting(#[case] secs: u64, #[case] expected: &str) {
        assert_eq!(format_eta(secs), expected);
    }
}
