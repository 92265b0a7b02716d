//! libsql TaskStore implementation.
//!
//! One connection, guarded by a mutex so that transactions from different
//! workers of this process never interleave. Every multi-statement operation
//! runs inside `BEGIN IMMEDIATE ... COMMIT`, which also serialises writers
//! from other processes sharing the same database file.
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision and a
//! `Z` suffix, so comparisons in SQL are plain string comparisons.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Row, Value as SqlValue, params};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{
    Arg, BlobId, Failure, NewTask, Requirement, TaskDependency, TaskId, TaskRecord, TaskSpec,
    TaskStatus, WorkerId, reason,
};
use crate::impls::schema;
use crate::ports::{
    Candidates, ErrorTypeCount, RecentRow, Reported, StatsRows, StatusCount, StoreError,
    Submitted, TaskFilter, TaskStore,
};
use crate::queue::{ReclaimPolicy, ReclaimReport, RetryCascade, RetrySelection};

const TASK_COLUMNS: &str = "id, function, args, blob_arg, status, result, worker, attempts, \
     not_before, error, log, broken_reason, date_created, date_modified, date_started, date_finished, \
     crashes";

/// Some incoming edge of `tasks.id` is not satisfied.
const HAS_UNFINISHED_PREV: &str = "EXISTS (SELECT 1 FROM task_dependencies d \
     JOIN tasks p ON p.id = d.prev WHERE d.next = tasks.id AND p.status != 'success')";

/// Some incoming edge of `tasks.id` points at a failed task.
const HAS_FAILED_PREV: &str = "EXISTS (SELECT 1 FROM task_dependencies d \
     JOIN tasks p ON p.id = d.prev WHERE d.next = tasks.id AND p.status IN ('broken', 'error'))";

/// libsql-backed TaskStore.
pub struct LibSqlTaskStore {
    // The connection is only valid while its Database lives.
    _db: Arc<Database>,
    conn: Mutex<Connection>,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Connection(format!("failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to open libsql database: {e}")))?;
        let store = Self::from_database(db).await?;
        store.pragma("PRAGMA journal_mode = WAL").await?;
        info!(path = %path.display(), "task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("failed to create connection: {e}")))?;
        let store = Self {
            _db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        // Another process may be migrating the same file.
        store.pragma("PRAGMA busy_timeout = 5000").await?;
        schema::run_migrations(&*store.conn.lock().await).await?;
        store.pragma("PRAGMA foreign_keys = ON").await?;
        Ok(store)
    }

    // PRAGMAs that report their new value return a row; drain it.
    async fn pragma(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query(sql, ()).await.map_err(query_err)?;
        while rows.next().await.map_err(query_err)?.is_some() {}
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Convert `Option<String>` to a libsql value.
fn opt_text(s: Option<String>) -> SqlValue {
    match s {
        Some(s) => SqlValue::Text(s),
        None => SqlValue::Null,
    }
}

fn get_text(row: &Row, idx: i32, field: &'static str) -> Result<String, StoreError> {
    match row.get_value(idx).map_err(query_err)? {
        SqlValue::Text(s) => Ok(s),
        other => Err(StoreError::decode(field, format!("expected text, got {other:?}"))),
    }
}

fn get_opt_text(row: &Row, idx: i32, field: &'static str) -> Result<Option<String>, StoreError> {
    match row.get_value(idx).map_err(query_err)? {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(s)),
        other => Err(StoreError::decode(field, format!("expected text, got {other:?}"))),
    }
}

fn get_int(row: &Row, idx: i32, field: &'static str) -> Result<i64, StoreError> {
    match row.get_value(idx).map_err(query_err)? {
        SqlValue::Integer(n) => Ok(n),
        SqlValue::Null => Ok(0),
        other => Err(StoreError::decode(field, format!("expected integer, got {other:?}"))),
    }
}

fn parse_ts(s: &str, field: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::decode(field, format!("{s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>, field: &'static str) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_ts(&s, field)).transpose()
}

fn parse_task_id(s: &str, field: &'static str) -> Result<TaskId, StoreError> {
    TaskId::parse(s).map_err(|e| StoreError::decode(field, e))
}

fn parse_status(s: &str) -> Result<TaskStatus, StoreError> {
    s.parse().map_err(|e| StoreError::decode("tasks.status", e))
}

/// Map a row selected with `TASK_COLUMNS` to a TaskRecord.
fn row_to_record(row: &Row) -> Result<TaskRecord, StoreError> {
    let args: Vec<Arg> = serde_json::from_str(&get_text(row, 2, "tasks.args")?)
        .map_err(|e| StoreError::decode("tasks.args", e))?;
    let blob_arg = get_opt_text(row, 3, "tasks.blob_arg")?
        .map(|s| BlobId::parse(&s).map_err(|e| StoreError::decode("tasks.blob_arg", e)))
        .transpose()?;
    let result = get_opt_text(row, 5, "tasks.result")?
        .map(|s| BlobId::parse(&s).map_err(|e| StoreError::decode("tasks.result", e)))
        .transpose()?;
    let worker = get_opt_text(row, 6, "tasks.worker")?
        .map(|s| s.parse::<WorkerId>().map_err(|e| StoreError::decode("tasks.worker", e)))
        .transpose()?;
    let attempts = u32::try_from(get_int(row, 7, "tasks.attempts")?)
        .map_err(|e| StoreError::decode("tasks.attempts", e))?;
    let crashes = u32::try_from(get_int(row, 16, "tasks.crashes")?)
        .map_err(|e| StoreError::decode("tasks.crashes", e))?;

    Ok(TaskRecord {
        id: parse_task_id(&get_text(row, 0, "tasks.id")?, "tasks.id")?,
        function: get_text(row, 1, "tasks.function")?,
        args,
        blob_arg,
        status: parse_status(&get_text(row, 4, "tasks.status")?)?,
        result,
        worker,
        attempts,
        crashes,
        not_before: parse_opt_ts(get_opt_text(row, 8, "tasks.not_before")?, "tasks.not_before")?,
        error: get_opt_text(row, 9, "tasks.error")?,
        log: get_opt_text(row, 10, "tasks.log")?,
        broken_reason: get_opt_text(row, 11, "tasks.broken_reason")?,
        date_created: parse_ts(&get_text(row, 12, "tasks.date_created")?, "tasks.date_created")?,
        date_modified: parse_ts(&get_text(row, 13, "tasks.date_modified")?, "tasks.date_modified")?,
        date_started: parse_opt_ts(get_opt_text(row, 14, "tasks.date_started")?, "tasks.date_started")?,
        date_finished: parse_opt_ts(
            get_opt_text(row, 15, "tasks.date_finished")?,
            "tasks.date_finished",
        )?,
    })
}

fn row_to_edge(row: &Row) -> Result<TaskDependency, StoreError> {
    Ok(TaskDependency {
        prev: parse_task_id(&get_text(row, 0, "task_dependencies.prev")?, "task_dependencies.prev")?,
        next: parse_task_id(&get_text(row, 1, "task_dependencies.next")?, "task_dependencies.next")?,
        name: get_text(row, 2, "task_dependencies.name")?,
    })
}

/// Recursive walk over dependents of `?1`, descending only into tasks
/// matching `filter` (a condition on alias `t`).
fn downstream_sql(filter: &str) -> String {
    format!(
        "WITH RECURSIVE downstream(id) AS ( \
             SELECT d.next FROM task_dependencies d JOIN tasks t ON t.id = d.next \
             WHERE d.prev = ?1 AND {filter} \
             UNION \
             SELECT d.next FROM task_dependencies d \
             JOIN downstream ds ON d.prev = ds.id \
             JOIN tasks t ON t.id = d.next \
             WHERE {filter} \
         ) SELECT id FROM downstream"
    )
}

// ── Statement helpers (run on an already-locked connection) ─────────

async fn begin(conn: &Connection) -> Result<(), StoreError> {
    if !conn.is_autocommit() {
        warn!("rolling back a transaction left open by a cancelled operation");
        conn.execute("ROLLBACK", ()).await.map_err(query_err)?;
    }
    conn.execute("BEGIN IMMEDIATE", ()).await.map_err(query_err)?;
    Ok(())
}

async fn finish<T>(conn: &Connection, result: Result<T, StoreError>) -> Result<T, StoreError> {
    let outcome = match result {
        Ok(value) => match conn.execute("COMMIT", ()).await {
            Ok(_) => return Ok(value),
            Err(e) => Err(query_err(e)),
        },
        Err(e) => Err(e),
    };
    if let Err(e) = conn.execute("ROLLBACK", ()).await {
        warn!(error = %e, "rollback failed");
    }
    outcome
}

async fn query_ids(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<Vec<TaskId>, StoreError> {
    let mut rows = conn.query(sql, params).await.map_err(query_err)?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err)? {
        ids.push(parse_task_id(&get_text(&row, 0, "tasks.id")?, "tasks.id")?);
    }
    Ok(ids)
}

async fn fetch_record(conn: &Connection, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let mut rows = conn
        .query(&sql, params![id.as_str()])
        .await
        .map_err(query_err)?;
    match rows.next().await.map_err(query_err)? {
        Some(row) => row_to_record(&row).map(Some),
        None => Ok(None),
    }
}

async fn task_exists(conn: &Connection, id: &TaskId) -> Result<bool, StoreError> {
    let ids = query_ids(conn, "SELECT id FROM tasks WHERE id = ?1", params![id.as_str()]).await?;
    Ok(!ids.is_empty())
}

/// A zero-row update either lost the claim or addressed an unknown task.
async fn lost_or_missing(conn: &Connection, id: &TaskId) -> Result<Reported, StoreError> {
    if task_exists(conn, id).await? {
        Ok(Reported::LostClaim)
    } else {
        Err(StoreError::NotFound(id.clone()))
    }
}

/// Is `prev` reachable downstream of `next` (or equal to it)?
async fn would_cycle(conn: &Connection, prev: &TaskId, next: &TaskId) -> Result<bool, StoreError> {
    if prev == next {
        return Ok(true);
    }
    let hits = query_ids(
        conn,
        "WITH RECURSIVE reach(id) AS ( \
             SELECT ?1 \
             UNION \
             SELECT d.next FROM task_dependencies d JOIN reach r ON d.prev = r.id \
         ) SELECT id FROM reach WHERE id = ?2 LIMIT 1",
        params![next.as_str(), prev.as_str()],
    )
    .await?;
    Ok(!hits.is_empty())
}

/// Reject an edge to an unknown task or one that would close a cycle
/// through the edges already written.
async fn check_edge(conn: &Connection, prev: &TaskId, next: &TaskId) -> Result<(), StoreError> {
    if prev == next {
        return Err(StoreError::Cycle {
            prev: prev.clone(),
            next: next.clone(),
        });
    }
    if !task_exists(conn, prev).await? {
        return Err(StoreError::NotFound(prev.clone()));
    }
    if would_cycle(conn, prev, next).await? {
        return Err(StoreError::Cycle {
            prev: prev.clone(),
            next: next.clone(),
        });
    }
    Ok(())
}

/// Insert-or-ignore the task row. Returns whether it was created.
async fn insert_row(
    conn: &Connection,
    id: &TaskId,
    spec: &TaskSpec,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let args = serde_json::to_string(&spec.args).map_err(|e| StoreError::decode("tasks.args", e))?;
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO tasks (id, function, args, blob_arg, status, attempts, \
             date_created, date_modified) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
            params![
                id.as_str(),
                spec.function.as_str(),
                args,
                opt_text(spec.blob_arg.as_ref().map(|b| b.to_string())),
                ts(now),
            ],
        )
        .await
        .map_err(query_err)?;
    Ok(inserted > 0)
}

/// Check, then insert-or-ignore, every edge of `task` whose row exists.
///
/// Each edge is checked against the ones written before it, so edges among
/// tasks staged in the same transaction are covered too.
async fn insert_edges(
    conn: &Connection,
    task: &NewTask,
    created: bool,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let next = task.id();
    let mut added = 0;
    for edge in task.edges() {
        check_edge(conn, &edge.prev, &next).await?;
        added += conn
            .execute(
                "INSERT OR IGNORE INTO task_dependencies (prev, next, name) VALUES (?1, ?2, ?3)",
                params![edge.prev.as_str(), edge.next.as_str(), edge.name],
            )
            .await
            .map_err(query_err)?;
    }
    if added > 0 && !created {
        conn.execute(
            "UPDATE tasks SET date_modified = ?2 WHERE id = ?1",
            params![next.as_str(), ts(now)],
        )
        .await
        .map_err(query_err)?;
    }
    Ok(())
}

/// Break every waiting task downstream of `root`.
async fn propagate_failure(
    conn: &Connection,
    root: &TaskId,
    now: DateTime<Utc>,
) -> Result<Vec<TaskId>, StoreError> {
    let doomed = query_ids(
        conn,
        &downstream_sql("t.status IN ('pending', 'deferred')"),
        params![root.as_str()],
    )
    .await?;
    let message = format!("upstream dependency {root} failed");
    for id in &doomed {
        conn.execute(
            "UPDATE tasks SET status = 'broken', broken_reason = ?2, error = ?3, \
             date_finished = ?4, date_modified = ?4 \
             WHERE id = ?1 AND status IN ('pending', 'deferred')",
            params![
                id.as_str(),
                reason::UPSTREAM_DEPENDENCY_FAILED,
                message.clone(),
                ts(now)
            ],
        )
        .await
        .map_err(query_err)?;
    }
    Ok(doomed)
}

async fn reset_for_retry(
    conn: &Connection,
    id: &TaskId,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn
        .execute(
            "UPDATE tasks SET status = 'pending', error = NULL, log = NULL, broken_reason = NULL, \
             result = NULL, worker = NULL, attempts = 0, crashes = 0, not_before = NULL, \
             date_started = NULL, date_finished = NULL, date_modified = ?2 \
             WHERE id = ?1 AND status IN ('broken', 'error')",
            params![id.as_str(), ts(now)],
        )
        .await
        .map_err(query_err)?;
    Ok(changed > 0)
}

// ── Operations (inside a transaction) ───────────────────────────────

async fn submit_tx(
    conn: &Connection,
    task: NewTask,
    now: DateTime<Utc>,
) -> Result<Submitted, StoreError> {
    let id = task.id();
    let created = insert_row(conn, &id, &task.spec, now).await?;
    insert_edges(conn, &task, created, now).await?;
    Ok(Submitted { id, created })
}

async fn break_upstream_tx(
    conn: &Connection,
    id: &TaskId,
    cause: &TaskId,
    now: DateTime<Utc>,
) -> Result<Vec<TaskId>, StoreError> {
    let changed = conn
        .execute(
            "UPDATE tasks SET status = 'broken', broken_reason = ?2, error = ?3, \
             date_finished = ?4, date_modified = ?4 \
             WHERE id = ?1 AND status IN ('pending', 'deferred')",
            params![
                id.as_str(),
                reason::UPSTREAM_DEPENDENCY_FAILED,
                format!("upstream dependency {cause} failed"),
                ts(now)
            ],
        )
        .await
        .map_err(query_err)?;
    if changed == 0 {
        if task_exists(conn, id).await? {
            return Ok(Vec::new());
        }
        return Err(StoreError::NotFound(id.clone()));
    }
    let mut broken = vec![id.clone()];
    broken.extend(propagate_failure(conn, id, now).await?);
    Ok(broken)
}

async fn complete_tx(
    conn: &Connection,
    id: &TaskId,
    worker: WorkerId,
    result: Option<BlobId>,
    children: Vec<NewTask>,
    now: DateTime<Utc>,
) -> Result<Reported, StoreError> {
    let changed = conn
        .execute(
            "UPDATE tasks SET status = 'success', result = ?3, error = NULL, broken_reason = NULL, \
             date_finished = ?4, date_modified = ?4 \
             WHERE id = ?1 AND status = 'running' AND worker = ?2",
            params![
                id.as_str(),
                worker.to_string(),
                opt_text(result.map(|r| r.to_string())),
                ts(now)
            ],
        )
        .await
        .map_err(query_err)?;
    if changed == 0 {
        return lost_or_missing(conn, id).await;
    }

    // Rows first, so a child may wait on a sibling listed after it.
    let mut created = Vec::with_capacity(children.len());
    for child in &children {
        created.push(insert_row(conn, &child.id(), &child.spec, now).await?);
    }
    for (child, created) in children.iter().zip(created) {
        insert_edges(conn, child, created, now).await?;
    }
    Ok(Reported::Recorded)
}

async fn fail_tx(
    conn: &Connection,
    id: &TaskId,
    worker: WorkerId,
    failure: Failure,
    now: DateTime<Utc>,
) -> Result<Reported, StoreError> {
    let changed = match failure {
        Failure::Broken { reason, message } => conn
            .execute(
                "UPDATE tasks SET status = 'broken', broken_reason = ?3, error = ?4, \
                 date_finished = ?5, date_modified = ?5 \
                 WHERE id = ?1 AND status = 'running' AND worker = ?2",
                params![id.as_str(), worker.to_string(), reason, message, ts(now)],
            )
            .await
            .map_err(query_err)?,
        Failure::Error { message, log } => conn
            .execute(
                "UPDATE tasks SET status = 'error', error = ?3, log = ?4, \
                 date_finished = ?5, date_modified = ?5 \
                 WHERE id = ?1 AND status = 'running' AND worker = ?2",
                params![id.as_str(), worker.to_string(), message, opt_text(log), ts(now)],
            )
            .await
            .map_err(query_err)?,
    };
    if changed == 0 {
        return lost_or_missing(conn, id).await;
    }
    propagate_failure(conn, id, now).await?;
    Ok(Reported::Recorded)
}

async fn defer_tx(
    conn: &Connection,
    id: &TaskId,
    worker: WorkerId,
    requirements: Vec<Requirement>,
    now: DateTime<Utc>,
) -> Result<Reported, StoreError> {
    let changed = conn
        .execute(
            "UPDATE tasks SET status = 'deferred', worker = NULL, date_modified = ?3 \
             WHERE id = ?1 AND status = 'running' AND worker = ?2",
            params![id.as_str(), worker.to_string(), ts(now)],
        )
        .await
        .map_err(query_err)?;
    if changed == 0 {
        return lost_or_missing(conn, id).await;
    }

    for requirement in requirements {
        let prev = requirement.spec.id();
        insert_row(conn, &prev, &requirement.spec, now).await?;
        check_edge(conn, &prev, id).await?;
        conn.execute(
            "INSERT OR IGNORE INTO task_dependencies (prev, next, name) VALUES (?1, ?2, ?3)",
            params![prev.as_str(), id.as_str(), requirement.name],
        )
        .await
        .map_err(query_err)?;
    }
    Ok(Reported::Recorded)
}

async fn retry_tx(
    conn: &Connection,
    selection: &RetrySelection,
    cascade: RetryCascade,
    now: DateTime<Utc>,
) -> Result<Vec<TaskId>, StoreError> {
    let roots = match selection {
        RetrySelection::Ids(ids) => ids.clone(),
        RetrySelection::Function(function) => {
            query_ids(
                conn,
                "SELECT id FROM tasks WHERE function = ?1 AND status IN ('broken', 'error') \
                 ORDER BY date_created, id",
                params![function.as_str()],
            )
            .await?
        }
        RetrySelection::AllFailed => {
            query_ids(
                conn,
                "SELECT id FROM tasks WHERE status IN ('broken', 'error') ORDER BY date_created, id",
                (),
            )
            .await?
        }
    };

    let cascade_sql = downstream_sql("t.status = 'broken' AND t.broken_reason = ?2");
    let mut rearmed = Vec::new();
    let mut seen = HashSet::new();
    for root in roots {
        if !seen.insert(root.clone()) || !reset_for_retry(conn, &root, now).await? {
            continue;
        }
        rearmed.push(root.clone());
        if cascade == RetryCascade::Propagated {
            let downstream = query_ids(
                conn,
                &cascade_sql,
                params![root.as_str(), reason::UPSTREAM_DEPENDENCY_FAILED],
            )
            .await?;
            for id in downstream {
                if seen.insert(id.clone()) && reset_for_retry(conn, &id, now).await? {
                    rearmed.push(id);
                }
            }
        }
    }
    Ok(rearmed)
}

async fn reclaim_tx(
    conn: &Connection,
    stale_before: DateTime<Utc>,
    policy: &ReclaimPolicy,
    now: DateTime<Utc>,
) -> Result<ReclaimReport, StoreError> {
    let mut rows = conn
        .query(
            "SELECT id, crashes FROM tasks WHERE status = 'running' AND date_modified < ?1 \
             ORDER BY date_modified, id",
            params![ts(stale_before)],
        )
        .await
        .map_err(query_err)?;
    let mut stale = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err)? {
        let id = parse_task_id(&get_text(&row, 0, "tasks.id")?, "tasks.id")?;
        let crashes = u32::try_from(get_int(&row, 1, "tasks.crashes")?)
            .map_err(|e| StoreError::decode("tasks.crashes", e))?;
        stale.push((id, crashes.saturating_add(1)));
    }
    drop(rows);

    let mut report = ReclaimReport::default();
    for (id, crashes) in stale {
        if policy.is_exhausted(crashes) {
            conn.execute(
                "UPDATE tasks SET status = 'error', error = ?2, log = NULL, crashes = ?4, \
                 date_finished = ?3, date_modified = ?3 WHERE id = ?1 AND status = 'running'",
                params![
                    id.as_str(),
                    format!("crash loop: exceeded {} attempts", policy.max_attempts),
                    ts(now),
                    i64::from(crashes)
                ],
            )
            .await
            .map_err(query_err)?;
            propagate_failure(conn, &id, now).await?;
            report.exhausted.push(id);
        } else {
            conn.execute(
                "UPDATE tasks SET status = 'pending', worker = NULL, not_before = ?2, \
                 crashes = ?4, date_modified = ?3 WHERE id = ?1 AND status = 'running'",
                params![
                    id.as_str(),
                    ts(policy.not_before(crashes, now)),
                    ts(now),
                    i64::from(crashes)
                ],
            )
            .await
            .map_err(query_err)?;
            report.requeued.push(id);
        }
    }
    Ok(report)
}

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn submit(&self, task: NewTask, now: DateTime<Utc>) -> Result<Submitted, StoreError> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = submit_tx(&conn, task, now).await;
        finish(&conn, result).await
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        fetch_record(&conn, id).await
    }

    async fn dependencies(
        &self,
        id: &TaskId,
    ) -> Result<Vec<(TaskDependency, TaskStatus)>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT d.prev, d.next, d.name, COALESCE(p.status, 'pending') \
                 FROM task_dependencies d LEFT JOIN tasks p ON p.id = d.prev \
                 WHERE d.next = ?1 ORDER BY d.id",
                params![id.as_str()],
            )
            .await
            .map_err(query_err)?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let status = parse_status(&get_text(&row, 3, "tasks.status")?)?;
            edges.push((row_to_edge(&row)?, status));
        }
        Ok(edges)
    }

    async fn dependents(&self, id: &TaskId) -> Result<Vec<TaskDependency>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT prev, next, name FROM task_dependencies WHERE prev = ?1 ORDER BY id",
                params![id.as_str()],
            )
            .await
            .map_err(query_err)?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            edges.push(row_to_edge(&row)?);
        }
        Ok(edges)
    }

    async fn find(
        &self,
        candidates: Candidates,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let condition = match candidates {
            Candidates::Ready => format!(
                "status = 'pending' AND (not_before IS NULL OR not_before <= ?1) \
                 AND NOT {HAS_UNFINISHED_PREV}"
            ),
            Candidates::DeferredSatisfied => {
                format!("status = 'deferred' AND ?1 IS NOT NULL AND NOT {HAS_UNFINISHED_PREV}")
            }
            Candidates::UpstreamFailed => format!(
                "status IN ('pending', 'deferred') AND ?1 IS NOT NULL AND {HAS_FAILED_PREV}"
            ),
        };
        let sql = format!(
            "SELECT id FROM tasks WHERE {condition} ORDER BY date_created, id LIMIT ?2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock().await;
        query_ids(&conn, &sql, params![ts(now), limit]).await
    }

    async fn promote_deferred(&self, id: &TaskId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "UPDATE tasks SET status = 'pending', date_modified = ?2 \
             WHERE id = ?1 AND status = 'deferred' AND NOT {HAS_UNFINISHED_PREV}"
        );
        let changed = conn
            .execute(&sql, params![id.as_str(), ts(now)])
            .await
            .map_err(query_err)?;
        if changed == 0 && !task_exists(&conn, id).await? {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(changed > 0)
    }

    async fn break_upstream(
        &self,
        id: &TaskId,
        cause: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = break_upstream_tx(&conn, id, cause, now).await;
        finish(&conn, result).await
    }

    async fn claim(
        &self,
        id: &TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "UPDATE tasks SET status = 'running', worker = ?2, attempts = attempts + 1, \
             not_before = NULL, date_started = ?3, date_finished = NULL, date_modified = ?3 \
             WHERE id = ?1 AND status = 'pending' \
             AND (not_before IS NULL OR not_before <= ?3) AND NOT {HAS_UNFINISHED_PREV}"
        );
        let changed = conn
            .execute(&sql, params![id.as_str(), worker.to_string(), ts(now)])
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Ok(None);
        }
        fetch_record(&conn, id).await
    }

    async fn heartbeat(
        &self,
        id: &TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE tasks SET date_modified = ?3 \
                 WHERE id = ?1 AND status = 'running' AND worker = ?2",
                params![id.as_str(), worker.to_string(), ts(now)],
            )
            .await
            .map_err(query_err)?;
        Ok(changed > 0)
    }

    async fn complete(
        &self,
        id: &TaskId,
        worker: WorkerId,
        result: Option<BlobId>,
        children: Vec<NewTask>,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = complete_tx(&conn, id, worker, result, children, now).await;
        finish(&conn, result).await
    }

    async fn fail(
        &self,
        id: &TaskId,
        worker: WorkerId,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = fail_tx(&conn, id, worker, failure, now).await;
        finish(&conn, result).await
    }

    async fn defer(
        &self,
        id: &TaskId,
        worker: WorkerId,
        requirements: Vec<Requirement>,
        now: DateTime<Utc>,
    ) -> Result<Reported, StoreError> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = defer_tx(&conn, id, worker, requirements, now).await;
        finish(&conn, result).await
    }

    async fn retry(
        &self,
        selection: &RetrySelection,
        cascade: RetryCascade,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = retry_tx(&conn, selection, cascade, now).await;
        finish(&conn, result).await
    }

    async fn reclaim_stale(
        &self,
        stale_before: DateTime<Utc>,
        policy: &ReclaimPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport, StoreError> {
        let conn = self.conn.lock().await;
        begin(&conn).await?;
        let result = reclaim_tx(&conn, stale_before, policy, now).await;
        finish(&conn, result).await
    }

    async fn stats_rows(&self, since: DateTime<Utc>) -> Result<StatsRows, StoreError> {
        let conn = self.conn.lock().await;

        let mut counts = Vec::new();
        let mut rows = conn
            .query(
                "SELECT function, status, COUNT(*) FROM tasks GROUP BY function, status",
                (),
            )
            .await
            .map_err(query_err)?;
        while let Some(row) = rows.next().await.map_err(query_err)? {
            counts.push(StatusCount {
                function: get_text(&row, 0, "tasks.function")?,
                status: parse_status(&get_text(&row, 1, "tasks.status")?)?,
                count: get_int(&row, 2, "count")?.max(0) as u64,
            });
        }
        drop(rows);
        counts.sort_by(|a, b| a.function.cmp(&b.function).then(a.status.cmp(&b.status)));

        let mut recent: Vec<RecentRow> = Vec::new();
        let mut rows = conn
            .query(
                "SELECT function, date_started, date_finished FROM tasks \
                 WHERE date_finished > ?1 AND date_started IS NOT NULL ORDER BY function",
                params![ts(since)],
            )
            .await
            .map_err(query_err)?;
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let function = get_text(&row, 0, "tasks.function")?;
            let started = parse_ts(&get_text(&row, 1, "tasks.date_started")?, "tasks.date_started")?;
            let finished =
                parse_ts(&get_text(&row, 2, "tasks.date_finished")?, "tasks.date_finished")?;
            let secs = (finished - started)
                .num_microseconds()
                .map(|us| us as f64 / 1_000_000.0)
                .unwrap_or_default();
            match recent.last_mut() {
                Some(last) if last.function == function => {
                    last.count += 1;
                    last.total_duration_secs += secs;
                }
                _ => recent.push(RecentRow {
                    function,
                    count: 1,
                    total_duration_secs: secs,
                }),
            }
        }
        drop(rows);

        let mut error_types = Vec::new();
        let mut rows = conn
            .query(
                "SELECT function, \
                     TRIM(CASE WHEN instr(COALESCE(error, ''), ':') > 0 \
                          THEN substr(error, 1, instr(error, ':') - 1) \
                          ELSE COALESCE(error, '') END) AS error_type, \
                     COUNT(*) AS count \
                 FROM tasks WHERE status = 'error' \
                 GROUP BY function, error_type \
                 ORDER BY count DESC, function, error_type",
                (),
            )
            .await
            .map_err(query_err)?;
        while let Some(row) = rows.next().await.map_err(query_err)? {
            error_types.push(ErrorTypeCount {
                function: get_text(&row, 0, "tasks.function")?,
                error_type: get_text(&row, 1, "error_type")?,
                count: get_int(&row, 2, "count")?.max(0) as u64,
            });
        }
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                (),
            )
            .await
            .map_err(query_err)?;
        let storage_bytes = match rows.next().await.map_err(query_err)? {
            Some(row) => u64::try_from(get_int(&row, 0, "page_count")?).ok(),
            None => None,
        };

        Ok(StatsRows {
            counts,
            recent,
            error_types,
            storage_bytes,
        })
    }

    async fn put_stat(&self, key: &str, value: Value, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO stats (key, value, date_modified) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             date_modified = excluded.date_modified",
            params![key, value.to_string(), ts(now)],
        )
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_stat(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT value FROM stats WHERE key = ?1", params![key])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let raw = get_text(&row, 0, "stats.value")?;
                serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| StoreError::decode("stats.value", e))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE (?1 IS NULL OR function = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY date_modified DESC, id LIMIT ?3"
        );
        let mut rows = conn
            .query(
                &sql,
                params![
                    opt_text(filter.function.clone()),
                    opt_text(filter.status.map(|s| s.as_str().to_string())),
                    i64::try_from(limit).unwrap_or(i64::MAX),
                ],
            )
            .await
            .map_err(query_err)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Dependency, TaskSpec};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn spec(name: &str) -> TaskSpec {
        TaskSpec::new(name, vec![Arg::value(name)])
    }

    #[tokio::test]
    async fn record_round_trips_through_the_table() {
        let store = LibSqlTaskStore::open_memory().await.unwrap();
        let blob = BlobId::of_bytes(b"abc123");
        let task = NewTask::new(
            TaskSpec::new("extract", vec![Arg::blob(blob.clone()), Arg::value(serde_json::json!({"lang": "en"}))]),
            vec![],
        );
        let id = store.submit(task.clone(), t0()).await.unwrap().id;

        let worker = WorkerId::generate();
        let claimed = store.claim(&id, worker, t0()).await.unwrap().unwrap();
        assert_eq!(claimed.worker, Some(worker));
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.date_started, Some(t0()));

        let result = BlobId::of_bytes(b"def456");
        let done = t0() + chrono::Duration::milliseconds(1500);
        store
            .complete(&id, worker, Some(result.clone()), vec![], done)
            .await
            .unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.spec(), task.spec);
        assert_eq!(record.blob_arg, Some(blob));
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.result, Some(result));
        assert_eq!(record.date_finished, Some(done));
        assert_eq!(record.duration(), Some(chrono::Duration::milliseconds(1500)));
    }

    #[tokio::test]
    async fn second_submission_is_idempotent() {
        let store = LibSqlTaskStore::open_memory().await.unwrap();
        let first = store.submit(NewTask::new(spec("a"), vec![]), t0()).await.unwrap();
        let second = store.submit(NewTask::new(spec("a"), vec![]), t0()).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.list(&TaskFilter::default(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_cycle_check_rolls_back_the_whole_report() {
        let store = LibSqlTaskStore::open_memory().await.unwrap();
        let a = store.submit(NewTask::new(spec("a"), vec![]), t0()).await.unwrap().id;
        let b = store
            .submit(NewTask::new(spec("b"), vec![Dependency::new(a.clone(), "dep")]), t0())
            .await
            .unwrap()
            .id;

        let worker = WorkerId::generate();
        store.claim(&a, worker, t0()).await.unwrap().unwrap();
        store.complete(&a, worker, None, vec![], t0()).await.unwrap();
        store.claim(&b, worker, t0()).await.unwrap().unwrap();

        // b emitting a as a child would close a -> b -> a.
        let err = store
            .complete(
                &b,
                worker,
                None,
                vec![NewTask::new(spec("a"), vec![Dependency::new(b.clone(), "child")])],
                t0(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cycle { .. }));

        let record = store.get(&b).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Running);

        // The connection is usable again after the rollback.
        assert_eq!(
            store.complete(&b, worker, None, vec![], t0()).await.unwrap(),
            Reported::Recorded
        );
    }

    #[tokio::test]
    async fn storage_size_is_reported() {
        let store = LibSqlTaskStore::open_memory().await.unwrap();
        let rows = store.stats_rows(t0()).await.unwrap();
        assert!(rows.storage_bytes.is_some_and(|n| n > 0));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("loom.sqlite");

        let id = {
            let store = LibSqlTaskStore::open(&path).await.unwrap();
            store.submit(NewTask::new(spec("a"), vec![]), t0()).await.unwrap().id
        };

        let store = LibSqlTaskStore::open(&path).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_opens_migrate_a_fresh_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.sqlite");

        let opens: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                tokio::spawn(async move { LibSqlTaskStore::open(&path).await })
            })
            .collect();
        let mut stores = Vec::new();
        for open in opens {
            stores.push(open.await.unwrap().unwrap());
        }

        let conn = stores[0].conn.lock().await;
        assert_eq!(
            schema::current_version(&conn).await.unwrap(),
            schema::latest_version()
        );
        let mut rows = conn
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), schema::latest_version());
    }
}
