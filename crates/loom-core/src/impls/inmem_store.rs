//! In-memory TaskStore implementation.
//!
//! Single-process only. One mutex guards the whole state, so every trait
//! method is one atomic step: claim is a compare-and-set on the record,
//! reports check ownership and apply their side effects under the same lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::domain::{
    error_type, reason, BlobId, Failure, NewTask, Requirement, TaskDependency, TaskId,
    TaskRecord, TaskStatus, WorkerId,
};
use crate::ports::{
    Candidates, ErrorTypeCount, RecentRow, Reported, StatsRows, StatusCount, StoreError,
    Submitted, TaskFilter, TaskStore,
};
use crate::queue::{
    DependencyGraph, ReclaimPolicy, ReclaimReport, Readiness, RetryCascade, RetrySelection,
};

/// In-memory store state.
#[derive(Default)]
struct InMemoryStoreState {
    /// All task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Dependency edges, both directions.
    graph: DependencyGraph,

    /// Persisted statistics snapshots.
    stats: HashMap<String, Value>,
}

impl InMemoryStoreState {
    fn readiness(&self, id: &TaskId) -> Readiness {
        Readiness::evaluate(self.graph.incoming(id).iter().map(|edge| {
            let status = self
                .records
                .get(&edge.prev)
                .map(|r| r.status)
                .unwrap_or(TaskStatus::Pending);
            (edge, status)
        }))
    }

    /// Reject edges that point at unknown tasks or would close a cycle.
    ///
    /// `pending` lists tasks about to be inserted in the same step and
    /// `staged` the edges already accepted for them.
    fn check_edge(
        &self,
        edge: &TaskDependency,
        pending: &HashSet<TaskId>,
        staged: &[TaskDependency],
    ) -> Result<(), StoreError> {
        let cycle = || StoreError::Cycle {
            prev: edge.prev.clone(),
            next: edge.next.clone(),
        };
        if edge.prev == edge.next {
            return Err(cycle());
        }
        if !self.records.contains_key(&edge.prev) && !pending.contains(&edge.prev) {
            return Err(StoreError::NotFound(edge.prev.clone()));
        }
        if self.graph.would_cycle_with(&edge.prev, &edge.next, staged) {
            return Err(cycle());
        }
        Ok(())
    }

    /// Validate a batch inserted in one step. Edges between members of the
    /// batch count towards cycle detection.
    fn check_new_tasks(&self, tasks: &[NewTask]) -> Result<(), StoreError> {
        let pending: HashSet<TaskId> = tasks.iter().map(NewTask::id).collect();
        let mut staged = Vec::new();
        for task in tasks {
            for edge in task.edges() {
                self.check_edge(&edge, &pending, &staged)?;
                staged.push(edge);
            }
        }
        Ok(())
    }

    /// Insert-or-ignore plus edges. Caller has already validated.
    fn insert_task(&mut self, task: NewTask, now: DateTime<Utc>) -> Submitted {
        let id = task.id();
        let edges: Vec<TaskDependency> = task.edges().collect();
        let created = !self.records.contains_key(&id);
        if created {
            self.records.insert(id.clone(), TaskRecord::new(task.spec, now));
        }
        let mut added = false;
        for edge in edges {
            added |= self.graph.add(edge);
        }
        if added && !created {
            if let Some(record) = self.records.get_mut(&id) {
                record.touch(now);
            }
        }
        Submitted { id, created }
    }

    /// Running record owned by `worker`.
    fn owned(
        &mut self,
        id: &TaskId,
        worker: WorkerId,
    ) -> Result<Option<&mut TaskRecord>, StoreError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if record.status == TaskStatus::Running && record.worker == Some(worker) {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Break every waiting task downstream of `root`.
    fn propagate_failure(&mut self, root: &TaskId, now: DateTime<Utc>) -> Vec<TaskId> {
        let records = &self.records;
        let doomed = self.graph.walk_dependents(root, |node| {
            records.get(node).is_some_and(|r| r.status.is_waiting())
        });
        for id in &doomed {
            if let Some(record) = self.records.get_mut(id) {
                record.mark_broken(
                    reason::UPSTREAM_DEPENDENCY_FAILED,
                    format!("upstream dependency {root} failed"),
                    now,
                );
            }
        }
        doomed
    }

    fn matches_selection(record: &TaskRecord, selection: &RetrySelection) -> bool {
        if !record.status.is_failed() {
            return false;
        }
        match selection {
            RetrySelection::Ids(ids) => ids.contains(&record.id),
            RetrySelection::Function(function) => &record.function == function,
            RetrySelection::AllFailed => true,
        }
    }
}

/// In-memory TaskStore.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn submit(&self, task: NewTask, now: DateTime<Utc>) -> Result<Submitted, StoreError> {
        let mut state = self.state.lock().await;
        state.check_new_tasks(std::slice::from_ref(&task))?;
        Ok(state.insert_task(task, now))
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(id).cloned())
    }

    async fn dependencies(
        &self,
        id: &TaskId,
    ) -> Result<Vec<(TaskDependency, TaskStatus)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .graph
            .incoming(id)
            .iter()
            .map(|edge| {
                let status = state
                    .records
                    .get(&edge.prev)
                    .map(|r| r.status)
                    .unwrap_or(TaskStatus::Pending);
                (edge.clone(), status)
            })
            .collect())
    }

    async fn dependents(&self, id: &TaskId) -> Result<Vec<TaskDependency>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.graph.outgoing_edges(id))
    }

    async fn find(
        &self,
        candidates: Candidates,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<&TaskRecord> = state
            .records
            .values()
            .filter(|record| match candidates {
                Candidates::Ready => {
                    record.status == TaskStatus::Pending
                        && !record.is_backing_off(now)
                        && state.readiness(&record.id).is_ready()
                }
                Candidates::DeferredSatisfied => {
                    record.status == TaskStatus::Deferred
                        && state.readiness(&record.id).is_ready()
                }
                Candidates::UpstreamFailed => {
                    record.status.is_waiting()
                        && matches!(
                            state.readiness(&record.id),
                            Readiness::UpstreamFailed { .. }
                        )
                }
            })
            .collect();
        found.sort_by(|a, b| {
            a.date_created
                .cmp(&b.date_created)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found.into_iter().take(limit).map(|r| r.id.clone()).collect())
    }

    async fn promote_deferred(&self, id: &TaskId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.readiness(id).is_ready() {
            return Ok(false);
        }
        match state.records.get_mut(id) {
            Some(record) if record.status == TaskStatus::Deferred => {
                record.promote(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    async fn break_upstream(
        &self,
        id: &TaskId,
        cause: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if !record.status.is_waiting() {
            return Ok(Vec::new());
        }
        record.mark_broken(
            reason::UPSTREAM_DEPENDENCY_FAILED,
            format!("upstream dependency {cause} failed"),
            now,
        );
        let mut broken = vec![id.clone()];
        broken.extend(state.propagate_failure(id, now));
        Ok(broken)
    }

    async fn claim(
        &self,
        id: &TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let ready = state.readiness(id).is_ready();
        match state.records.get_mut(id) {
            Some(record)
                if ready
                    && record.status == TaskStatus::Pending
                    && !record.is_backing_off(now) =>
            {
                record.claim(worker, now);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn heartbeat(
        &self,
        id: &TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.owned(id, worker)? {
            Some(record) => {
                record.touch(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: &TaskId,
        worker: WorkerId,
        result: Option<BlobId>,
        children: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError> {
        let mut state = self.state.lock().await;
        if state.owned(id, worker)?.is_none() {
            return Ok(Reported::LostClaim);
        }
        state.check_new_tasks(&children)?;
        if let Some(record) = state.owned(id, worker)? {
            record.mark_success(result, now);
        }
        for child in children {
            state.insert_task(child, now);
        }
        Ok(Reported::Recorded)
    }

    async fn fail(
        &self,
        id: &TaskId,
        worker: WorkerId,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.owned(id, worker)? else {
            return Ok(Reported::LostClaim);
        };
        match failure {
            Failure::Broken { reason, message } => record.mark_broken(&reason, message, now),
            Failure::Error { message, log } => record.mark_error(message, log, now),
        }
        state.propagate_failure(id, now);
        Ok(Reported::Recorded)
    }

    async fn defer(
        &self,
        id: &TaskId,
        worker: WorkerId,
        requirements: Vec<Requirement>,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError> {
        let mut state = self.state.lock().await;
        if state.owned(id, worker)?.is_none() {
            return Ok(Reported::LostClaim);
        }
        let pending: HashSet<TaskId> = requirements.iter().map(|r| r.spec.id()).collect();
        let mut staged = Vec::new();
        for requirement in &requirements {
            let edge = TaskDependency {
                prev: requirement.spec.id(),
                next: id.clone(),
                name: requirement.name.clone(),
            };
            state.check_edge(&edge, &pending, &staged)?;
            staged.push(edge);
        }
        for requirement in requirements {
            let prev = state.insert_task(NewTask::new(requirement.spec, Vec::new()), now).id;
            state.graph.add(TaskDependency {
                prev,
                next: id.clone(),
                name: requirement.name,
            });
        }
        if let Some(record) = state.owned(id, worker)? {
            record.mark_deferred(now);
        }
        Ok(Reported::Recorded)
    }

    async fn retry(
        &self,
        selection: &RetrySelection,
        cascade: RetryCascade,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let mut state = self.state.lock().await;
        let mut roots: Vec<&TaskRecord> = state
            .records
            .values()
            .filter(|r| InMemoryStoreState::matches_selection(r, selection))
            .collect();
        roots.sort_by(|a, b| a.date_created.cmp(&b.date_created).then_with(|| a.id.cmp(&b.id)));
        let roots: Vec<TaskId> = roots.into_iter().map(|r| r.id.clone()).collect();

        let mut rearmed = Vec::new();
        let mut seen = HashSet::new();
        for root in roots {
            let mut batch = vec![root.clone()];
            if cascade == RetryCascade::Propagated {
                let records = &state.records;
                batch.extend(state.graph.walk_dependents(&root, |node| {
                    records.get(node).is_some_and(|r| {
                        r.status == TaskStatus::Broken
                            && r.broken_reason.as_deref() == Some(reason::UPSTREAM_DEPENDENCY_FAILED)
                    })
                }));
            }
            for id in batch {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(record) = state.records.get_mut(&id) {
                    if record.status.is_failed() {
                        record.reset_for_retry(now);
                        rearmed.push(id);
                    }
                }
            }
        }
        Ok(rearmed)
    }

    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        policy: &ReclaimPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport, StoreError> {
        let mut state = self.state.lock().await;
        let stale: Vec<TaskId> = state
            .records
            .values()
            .filter(|r| r.status == TaskStatus::Running && r.date_modified < stale_before)
            .map(|r| r.id.clone())
            .collect();

        let mut report = ReclaimReport::default();
        for id in stale {
            let Some(record) = state.records.get_mut(&id) else {
                continue;
            };
            let crashes = record.crashes + 1;
            if policy.is_exhausted(crashes) {
                record.crashes = crashes;
                record.mark_error(
                    format!("crash loop: exceeded {} attempts", policy.max_attempts),
                    None,
                    now,
                );
                state.propagate_failure(&id, now);
                report.exhausted.push(id);
            } else {
                let not_before = policy.not_before(crashes, now);
                record.requeue(Some(not_before), now);
                report.requeued.push(id);
            }
        }
        Ok(report)
    }

    async fn stats_rows(&self, since: DateTime<Utc>) -> Result<StatsRows, StoreError> {
        let state = self.state.lock().await;

        let mut counts: HashMap<(String, TaskStatus), u64> = HashMap::new();
        let mut recent: HashMap<String, (u64, f64)> = HashMap::new();
        let mut errors: HashMap<(String, String), u64> = HashMap::new();
        for record in state.records.values() {
            *counts
                .entry((record.function.clone(), record.status))
                .or_default() += 1;

            if let (Some(finished), Some(duration)) = (record.date_finished, record.duration()) {
                if finished > since {
                    let entry = recent.entry(record.function.clone()).or_default();
                    entry.0 += 1;
                    entry.1 += duration_secs(duration);
                }
            }

            if record.status == TaskStatus::Error {
                let kind = error_type(record.error.as_deref().unwrap_or_default()).to_string();
                *errors.entry((record.function.clone(), kind)).or_default() += 1;
            }
        }

        let mut counts: Vec<StatusCount> = counts
            .into_iter()
            .map(|((function, status), count)| StatusCount {
                function,
                status,
                count,
            })
            .collect();
        counts.sort_by(|a, b| a.function.cmp(&b.function).then(a.status.cmp(&b.status)));

        let mut recent: Vec<RecentRow> = recent
            .into_iter()
            .map(|(function, (count, total_duration_secs))| RecentRow {
                function,
                count,
                total_duration_secs,
            })
            .collect();
        recent.sort_by(|a, b| a.function.cmp(&b.function));

        let mut error_types: Vec<ErrorTypeCount> = errors
            .into_iter()
            .map(|((function, error_type), count)| ErrorTypeCount {
                function,
                error_type,
                count,
            })
            .collect();
        error_types.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.function.cmp(&b.function))
                .then_with(|| a.error_type.cmp(&b.error_type))
        });

        Ok(StatsRows {
            counts,
            recent,
            error_types,
            storage_bytes: None,
        })
    }

    async fn put_stat(
        &self,
        key: &str,
        value: Value,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.stats.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_stat(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.stats.get(key).cloned())
    }

    async fn list(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<&TaskRecord> = state
            .records
            .values()
            .filter(|r| filter.function.as_ref().is_none_or(|f| &r.function == f))
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .collect();
        found.sort_by(|a, b| {
            b.date_modified
                .cmp(&a.date_modified)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found.into_iter().take(limit).cloned().collect())
    }
}

fn duration_secs(duration: chrono::Duration) -> f64 {
    duration
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| duration.num_seconds() as f64)
}
