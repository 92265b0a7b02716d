//! Task records, arguments and dependency edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{BlobId, TaskId, WorkerId};
use super::status::TaskStatus;

/// Broken reason codes the engine itself produces.
///
/// Task functions declare their own codes (`Function::BROKEN_REASONS`);
/// these are the ones any task can end up with.
pub mod reason {
    /// A prerequisite ended in `broken` or `error`.
    pub const UPSTREAM_DEPENDENCY_FAILED: &str = "upstream_dependency_failed";

    /// No handler is registered under the task's function name.
    pub const UNKNOWN_FUNCTION: &str = "unknown_function";

    /// The argument list does not decode into the function's argument type.
    pub const INVALID_ARGUMENTS: &str = "invalid_arguments";

    /// A referenced blob is not in the content store.
    pub const MISSING_BLOB: &str = "missing_blob";

    pub const ENGINE: [&str; 4] = [
        UPSTREAM_DEPENDENCY_FAILED,
        UNKNOWN_FUNCTION,
        INVALID_ARGUMENTS,
        MISSING_BLOB,
    ];

    /// Is `reason` one of the engine's own codes or one the function declared?
    pub fn is_declared(reason: &str, declared: &[&str]) -> bool {
        ENGINE.contains(&reason) || declared.contains(&reason)
    }
}

/// One positional argument: a small JSON value or a reference to a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Value(Value),
    Blob(BlobId),
}

impl Arg {
    pub fn value(v: impl Into<Value>) -> Self {
        Arg::Value(v.into())
    }

    pub fn blob(id: BlobId) -> Self {
        Arg::Blob(id)
    }

    pub fn as_blob(&self) -> Option<&BlobId> {
        match self {
            Arg::Blob(id) => Some(id),
            Arg::Value(_) => None,
        }
    }

    /// Canonical JSON form, independent of map insertion order.
    fn canonical(&self) -> Value {
        let mut map = Map::new();
        match self {
            Arg::Value(v) => map.insert("value".to_string(), canonical_value(v)),
            Arg::Blob(id) => map.insert("blob".to_string(), Value::String(id.to_string())),
        };
        Value::Object(map)
    }
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonical_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// What to run: function name plus ordered arguments.
///
/// Two specs with the same function and arguments have the same [`TaskId`],
/// which is what makes submission idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub function: String,
    pub args: Vec<Arg>,

    /// Blob this task is "about", for indexing/search. Not part of the fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_arg: Option<BlobId>,
}

impl TaskSpec {
    pub fn new(function: impl Into<String>, args: Vec<Arg>) -> Self {
        let blob_arg = match args.as_slice() {
            [Arg::Blob(id), ..] => Some(id.clone()),
            _ => None,
        };
        Self {
            function: function.into(),
            args,
            blob_arg,
        }
    }

    pub fn with_blob_arg(mut self, blob: Option<BlobId>) -> Self {
        self.blob_arg = blob;
        self
    }

    /// Deterministic fingerprint of `(function, args)`.
    pub fn id(&self) -> TaskId {
        let encoded = Value::Array(vec![
            Value::String(self.function.clone()),
            Value::Array(self.args.iter().map(Arg::canonical).collect()),
        ])
        .to_string();
        TaskId::of_canonical(encoded.as_bytes())
    }
}

/// Incoming edge requested at submission time: "wait for `prev`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub prev: TaskId,
    pub name: String,
}

impl Dependency {
    pub fn new(prev: TaskId, name: impl Into<String>) -> Self {
        Self {
            prev,
            name: name.into(),
        }
    }
}

/// A task a running body needs before it can finish; see `TaskContext::require`.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub name: String,
    pub spec: TaskSpec,
}

/// Directed edge `prev -> next`; `next` may run only after `prev` succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskDependency {
    pub prev: TaskId,
    pub next: TaskId,
    /// Role of the dependency, e.g. "parent-archive-extracted".
    pub name: String,
}

/// A task to create together with its incoming edges.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub spec: TaskSpec,
    pub dependencies: Vec<Dependency>,
}

impl NewTask {
    pub fn new(spec: TaskSpec, dependencies: Vec<Dependency>) -> Self {
        Self { spec, dependencies }
    }

    pub fn id(&self) -> TaskId {
        self.spec.id()
    }

    pub fn edges(&self) -> impl Iterator<Item = TaskDependency> + '_ {
        let next = self.id();
        self.dependencies.iter().map(move |dep| TaskDependency {
            prev: dep.prev.clone(),
            next: next.clone(),
            name: dep.name.clone(),
        })
    }
}

/// Persisted task record.
///
/// This is the single source of truth for a task's state. Every mutation
/// goes through a method here so that `date_modified` is always refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub function: String,
    pub args: Vec<Arg>,
    pub blob_arg: Option<BlobId>,

    pub status: TaskStatus,
    pub result: Option<BlobId>,
    pub worker: Option<WorkerId>,

    /// Claims since the last operator retry.
    pub attempts: u32,

    /// Times the liveness reaper took the task back from a silent worker.
    /// Deferrals do not count. Bounded by the reclaim policy.
    #[serde(default)]
    pub crashes: u32,

    /// Earliest time the task may be claimed again (set by liveness reclaim).
    pub not_before: Option<DateTime<Utc>>,

    pub error: Option<String>,
    pub log: Option<String>,
    pub broken_reason: Option<String>,

    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id(),
            function: spec.function,
            args: spec.args,
            blob_arg: spec.blob_arg,
            status: TaskStatus::Pending,
            result: None,
            worker: None,
            attempts: 0,
            crashes: 0,
            not_before: None,
            error: None,
            log: None,
            broken_reason: None,
            date_created: now,
            date_modified: now,
            date_started: None,
            date_finished: None,
        }
    }

    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            function: self.function.clone(),
            args: self.args.clone(),
            blob_arg: self.blob_arg.clone(),
        }
    }

    /// Is the claim backoff still in effect at `now`?
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|t| t > now)
    }

    /// Wall-clock duration of the last finished attempt.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.date_started, self.date_finished) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Pending -> Running.
    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.worker = Some(worker);
        self.attempts += 1;
        self.not_before = None;
        self.date_started = Some(now);
        self.date_finished = None;
        self.date_modified = now;
    }

    /// Liveness heartbeat.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.date_modified = now;
    }

    pub fn mark_success(&mut self, result: Option<BlobId>, now: DateTime<Utc>) {
        self.status = TaskStatus::Success;
        self.result = result;
        self.error = None;
        self.broken_reason = None;
        self.date_finished = Some(now);
        self.date_modified = now;
    }

    pub fn mark_broken(&mut self, reason: &str, message: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Broken;
        self.broken_reason = Some(reason.to_string());
        self.error = Some(message);
        self.date_finished = Some(now);
        self.date_modified = now;
    }

    pub fn mark_error(&mut self, message: String, log: Option<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Error;
        self.error = Some(message);
        self.log = log;
        self.date_finished = Some(now);
        self.date_modified = now;
    }

    /// Running -> Deferred (waiting on a requirement discovered at runtime).
    pub fn mark_deferred(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Deferred;
        self.worker = None;
        self.date_modified = now;
    }

    /// Deferred -> Pending.
    pub fn promote(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.date_modified = now;
    }

    /// Running -> Pending after the owning worker stopped heart-beating.
    pub fn requeue(&mut self, not_before: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.crashes += 1;
        self.status = TaskStatus::Pending;
        self.worker = None;
        self.not_before = not_before;
        self.date_modified = now;
    }

    /// Broken | Error -> Pending, clearing everything the last attempt produced.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.error = None;
        self.log = None;
        self.broken_reason = None;
        self.result = None;
        self.worker = None;
        self.attempts = 0;
        self.crashes = 0;
        self.not_before = None;
        self.date_started = None;
        self.date_finished = None;
        self.date_modified = now;
    }
}
