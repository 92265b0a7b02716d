//! TaskStore port - タスクレコードと依存関係の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - 状態（TaskStatus）と試行回数
//! - 依存関係（task_dependencies）
//! - 統計スナップショット（stats）
//!
//! # 設計原則
//! - claim は条件付き更新（pending のときだけ running にする）
//! - 報告（complete/fail/defer）は worker が一致するときだけ反映する
//! - 子タスクの作成と親の success は同一トランザクション内
//! - 失敗の伝播（下流を broken にする）も失敗の記録と同一トランザクション内

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    BlobId, Failure, NewTask, Requirement, TaskDependency, TaskId, TaskRecord, TaskStatus,
    WorkerId,
};
use crate::queue::{ReclaimPolicy, ReclaimReport, RetryCascade, RetrySelection};

/// Persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("schema migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("corrupt stored value in {field}: {message}")]
    Decode { field: &'static str, message: String },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("dependency {prev} -> {next} would create a cycle")]
    Cycle { prev: TaskId, next: TaskId },
}

impl StoreError {
    pub fn decode(field: &'static str, message: impl ToString) -> Self {
        StoreError::Decode {
            field,
            message: message.to_string(),
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub id: TaskId,

    /// `false` when a task with the same fingerprint already existed.
    pub created: bool,
}

/// Result of a worker report.
///
/// A report from a worker that no longer owns the task (reclaimed after a
/// missed heartbeat, or already finished) is not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reported {
    Recorded,
    LostClaim,
}

impl Reported {
    pub fn is_recorded(self) -> bool {
        matches!(self, Reported::Recorded)
    }
}

/// Candidate sets the resolver sweeps over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidates {
    /// `pending`, not backing off, every incoming edge is `success`.
    Ready,

    /// `deferred`, every incoming edge is `success`.
    DeferredSatisfied,

    /// `pending` or `deferred` with at least one `broken`/`error` prerequisite.
    UpstreamFailed,
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub function: Option<String>,
    pub status: Option<TaskStatus>,
}

/// `(function, status) -> count` bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub function: String,
    pub status: TaskStatus,
    pub count: u64,
}

/// Tasks of one function finished (by a worker) inside the stats window.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentRow {
    pub function: String,
    pub count: u64,
    pub total_duration_secs: f64,
}

/// `error` tasks grouped by function and message prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTypeCount {
    pub function: String,
    pub error_type: String,
    pub count: u64,
}

/// Raw aggregates the estimator works from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsRows {
    pub counts: Vec<StatusCount>,
    pub recent: Vec<RecentRow>,
    pub error_types: Vec<ErrorTypeCount>,
    /// Size of the backing database, when the store has one.
    pub storage_bytes: Option<u64>,
}

/// TaskStore はタスク状態・依存・統計の正本
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert the task if its fingerprint is new, then add any missing edges.
    ///
    /// Idempotent: resubmitting the same `(function, args)` returns the
    /// existing id with `created == false`. Every `prev` must exist.
    async fn submit(&self, task: NewTask, now: DateTime<Utc>) -> Result<Submitted, StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Incoming edges of `id`, each with the current status of its `prev`.
    async fn dependencies(
        &self,
        id: &TaskId,
    ) -> Result<Vec<(TaskDependency, TaskStatus)>, StoreError>;

    /// Outgoing edges of `id`.
    async fn dependents(&self, id: &TaskId) -> Result<Vec<TaskDependency>, StoreError>;

    /// Up to `limit` ids of one candidate set, oldest first.
    async fn find(
        &self,
        candidates: Candidates,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// `deferred -> pending` if every incoming edge is still `success`.
    async fn promote_deferred(&self, id: &TaskId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Mark a waiting task `broken` because `cause` failed, then propagate to
    /// its waiting dependents. Returns every task that was broken.
    async fn break_upstream(
        &self,
        id: &TaskId,
        cause: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// Atomic `pending -> running`. `None` means someone else won the race
    /// (or the task is not ready); that is not an error.
    async fn claim(
        &self,
        id: &TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Refresh `date_modified` of a task the worker still owns.
    async fn heartbeat(
        &self,
        id: &TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `running -> success`, writing `children` (and their edges) in the same transaction.
    async fn complete(
        &self,
        id: &TaskId,
        worker: WorkerId,
        result: Option<BlobId>,
        children: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError>;

    /// `running -> broken | error`, breaking waiting dependents in the same transaction.
    async fn fail(
        &self,
        id: &TaskId,
        worker: WorkerId,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError>;

    /// `running -> deferred`, submitting each requirement and an edge
    /// `requirement -> id` in the same transaction.
    async fn defer(
        &self,
        id: &TaskId,
        worker: WorkerId,
        requirements: Vec<Requirement>,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError>;

    /// Re-arm selected `broken`/`error` tasks. Returns the ids actually re-armed.
    async fn retry(
        &self,
        selection: &RetrySelection,
        cascade: RetryCascade,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// Reclaim `running` tasks whose `date_modified` is older than `stale_before`.
    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        policy: &ReclaimPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport, StoreError>;

    /// Aggregates for the estimator; `recent` covers tasks finished after `since`.
    async fn stats_rows(&self, since: DateTime<Utc>) -> Result<StatsRows, StoreError>;

    async fn put_stat(&self, key: &str, value: Value, now: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn get_stat(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Tasks matching `filter`, most recently modified first.
    async fn list(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;
}
