//! Runtime - 実行ラッパー
//!
//! claim 済みの TaskRecord を受け取り、登録済み Handler を実行して結果を報告する。
//!
//! # フロー
//! 1. function 名から Handler を引く（未登録なら broken: unknown_function）
//! 2. 本体を別タスクで実行し、その間 heartbeat で date_modified を更新
//! 3. 結果を success / broken / error / deferred に振り分けて TaskStore に報告
//! 4. panic は error として記録（kind = panic）

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;

use crate::domain::{BlobId, Failure, TaskError, TaskId, TaskRecord, WorkerId, reason};
use crate::ports::{BlobStore, Clock, Reported, StoreError, TaskStore};
use crate::typed::context::Effects;
use crate::typed::{TaskContext, TypedRegistry};

/// Size limits and timings the wrapper applies to every attempt.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub heartbeat_interval: Duration,
    pub max_error_len: usize,
    pub max_log_len: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_error_len: 2000,
            max_log_len: 20_000,
        }
    }
}

/// How one attempt ended, from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Succeeded,
    Broken,
    Errored,
    Deferred,
    /// The report was rejected: the task was reclaimed while running.
    LostClaim,
}

/// What the body produced, before it is written to the store.
enum Report {
    Complete(Option<BlobId>, Effects),
    Defer(Effects),
    Fail(Failure),
}

pub struct Runtime {
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<TypedRegistry>,
    clock: Arc<dyn Clock>,
    limits: ExecutionLimits,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<TypedRegistry>,
        clock: Arc<dyn Clock>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            store,
            blobs,
            registry,
            clock,
            limits,
        }
    }

    pub fn registry(&self) -> &TypedRegistry {
        &self.registry
    }

    /// Run one claimed task and report its outcome.
    pub async fn execute(
        &self,
        record: TaskRecord,
        worker: WorkerId,
    ) -> Result<Execution, StoreError> {
        let id = record.id.clone();
        let report = self.run_body(record, worker).await;
        let now = self.clock.now();

        let (reported, execution) = match report {
            Report::Complete(result, effects) => {
                match self
                    .store
                    .complete(&id, worker, result, effects.children, now)
                    .await
                {
                    Ok(reported) => (reported, Execution::Succeeded),
                    Err(e @ (StoreError::Cycle { .. } | StoreError::NotFound(_))) => {
                        let failure = Failure::error(
                            format!("RejectedChildren: {e}"),
                            non_empty(effects.log),
                        );
                        self.report_failure(&id, worker, failure).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Report::Defer(effects) => {
                match self
                    .store
                    .defer(&id, worker, effects.requirements, now)
                    .await
                {
                    Ok(reported) => (reported, Execution::Deferred),
                    Err(e @ StoreError::Cycle { .. }) => {
                        let failure = Failure::error(
                            format!("RejectedRequirement: {e}"),
                            non_empty(effects.log),
                        );
                        self.report_failure(&id, worker, failure).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Report::Fail(failure) => self.report_failure(&id, worker, failure).await?,
        };

        match reported {
            Reported::Recorded => {
                tracing::info!(task_id = %id, worker = %worker, outcome = ?execution, "task finished");
                Ok(execution)
            }
            Reported::LostClaim => {
                tracing::warn!(task_id = %id, worker = %worker, "report rejected: claim lost while running");
                Ok(Execution::LostClaim)
            }
        }
    }

    async fn report_failure(
        &self,
        id: &TaskId,
        worker: WorkerId,
        failure: Failure,
    ) -> Result<(Reported, Execution), StoreError> {
        let failure = failure.truncated(self.limits.max_error_len, self.limits.max_log_len);
        let execution = match failure {
            Failure::Broken { .. } => Execution::Broken,
            Failure::Error { .. } => Execution::Errored,
        };
        let reported = self
            .store
            .fail(id, worker, failure, self.clock.now())
            .await?;
        Ok((reported, execution))
    }

    async fn run_body(&self, record: TaskRecord, worker: WorkerId) -> Report {
        let Some(handler) = self.registry.get(&record.function) else {
            return Report::Fail(Failure::broken(
                reason::UNKNOWN_FUNCTION,
                format!("no handler registered for function '{}'", record.function),
            ));
        };

        let id = record.id.clone();
        let args = record.args.clone();
        let ctx = TaskContext::new(record, Arc::clone(&self.blobs), Arc::clone(&self.store));
        let body = Arc::clone(&handler);
        let mut handle = tokio::spawn(async move {
            let mut ctx = ctx;
            let result = body.handle_dyn(&args, &mut ctx).await;
            (result, ctx.into_effects())
        });

        // interval の初回 tick は即時なので読み捨てる
        let mut ticker = tokio::time::interval(self.limits.heartbeat_interval);
        ticker.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = ticker.tick() => {
                    match self.store.heartbeat(&id, worker, self.clock.now()).await {
                        Ok(true) => tracing::trace!(task_id = %id, "heartbeat"),
                        Ok(false) => tracing::warn!(task_id = %id, worker = %worker, "heartbeat rejected: task no longer owned"),
                        Err(e) => tracing::warn!(task_id = %id, error = %e, "heartbeat failed"),
                    }
                }
            }
        };

        match joined {
            Ok((Ok(result), effects)) if effects.requirements.is_empty() => {
                Report::Complete(result, effects)
            }
            Ok((Ok(_), effects)) | Ok((Err(TaskError::Deferred), effects)) => {
                Report::Defer(effects)
            }
            Ok((Err(TaskError::Broken { reason: code, message }), effects)) => {
                if reason::is_declared(&code, handler.broken_reasons()) {
                    Report::Fail(Failure::broken(code, message))
                } else {
                    Report::Fail(Failure::error(
                        format!("UndeclaredBrokenReason: {code}: {message}"),
                        non_empty(effects.log),
                    ))
                }
            }
            Ok((Err(TaskError::Failed { kind, message }), effects)) => Report::Fail(
                Failure::error(format!("{kind}: {message}"), non_empty(effects.log)),
            ),
            Err(join_error) => Report::Fail(Failure::error(join_message(join_error), None)),
        }
    }
}

fn non_empty(log: String) -> Option<String> {
    (!log.is_empty()).then_some(log)
}

fn join_message(error: JoinError) -> String {
    if error.is_panic() {
        format!("panic: {}", panic_message(error.into_panic()))
    } else {
        format!("cancelled: {error}")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use crate::domain::{Arg, NewTask, TaskSpec, TaskStatus};
    use crate::impls::{InMemoryBlobStore, InMemoryTaskStore};
    use crate::ports::SystemClock;
    use crate::queue::{RetryCascade, RetrySelection};
    use crate::typed::handler::fixtures::{DigestHandler, EchoHandler};
    use crate::typed::task::fixtures::{Digest, Echo};
    use crate::typed::{Handler, Task};

    #[derive(Debug, Serialize, Deserialize)]
    struct Explode {}

    impl Task for Explode {
        const FUNCTION: &'static str = "test.explode";

        fn args(&self) -> Vec<Arg> {
            vec![]
        }
    }

    struct ExplodeHandler;

    #[async_trait]
    impl Handler<Explode> for ExplodeHandler {
        async fn handle(
            &self,
            _task: Explode,
            ctx: &mut TaskContext,
        ) -> Result<Option<BlobId>, TaskError> {
            ctx.log("about to fail");
            match ctx.attempt() {
                1 => Err(TaskError::failed("ServiceUnavailable", "converter returned 503")),
                2 => Err(TaskError::broken("not_declared", "made up")),
                _ => panic!("boom"),
            }
        }
    }

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        blobs: Arc<InMemoryBlobStore>,
        runtime: Runtime,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let mut registry = TypedRegistry::new();
        registry.register::<Echo, _>(EchoHandler).unwrap();
        registry.register::<Digest, _>(DigestHandler).unwrap();
        registry.register::<Explode, _>(ExplodeHandler).unwrap();
        let runtime = Runtime::new(
            store.clone(),
            blobs.clone(),
            Arc::new(registry),
            Arc::new(SystemClock),
            ExecutionLimits::default(),
        );
        Fixture {
            store,
            blobs,
            runtime,
        }
    }

    async fn claim(store: &InMemoryTaskStore, spec: TaskSpec) -> (TaskRecord, WorkerId) {
        let id = store
            .submit(NewTask::new(spec, vec![]), Utc::now())
            .await
            .unwrap()
            .id;
        let worker = WorkerId::generate();
        let record = store.claim(&id, worker, Utc::now()).await.unwrap().unwrap();
        (record, worker)
    }

    #[tokio::test]
    async fn success_records_result_blob() {
        let f = fixture();
        let task = Echo {
            text: "hi".into(),
        };
        let (record, worker) = claim(&f.store, task.spec()).await;
        let id = record.id.clone();

        let outcome = f.runtime.execute(record, worker).await.unwrap();
        assert_eq!(outcome, Execution::Succeeded);

        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        let result = stored.result.unwrap();
        assert_eq!(f.blobs.get(&result).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn unknown_function_is_broken() {
        let f = fixture();
        let (record, worker) = claim(&f.store, TaskSpec::new("nobody.home", vec![])).await;
        let id = record.id.clone();

        assert_eq!(f.runtime.execute(record, worker).await.unwrap(), Execution::Broken);
        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.broken_reason.as_deref(), Some("unknown_function"));
    }

    #[tokio::test]
    async fn declared_broken_reason_is_kept() {
        let f = fixture();
        let empty = f.blobs.put(Vec::new()).await.unwrap();
        let task = Digest {
            input: empty,
            rounds: 1,
        };
        let (record, worker) = claim(&f.store, task.spec()).await;
        let id = record.id.clone();

        assert_eq!(f.runtime.execute(record, worker).await.unwrap(), Execution::Broken);
        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.broken_reason.as_deref(), Some("empty_input"));
    }

    #[tokio::test]
    async fn missing_blob_is_broken() {
        let f = fixture();
        let task = Digest {
            input: BlobId::of_bytes(b"never stored"),
            rounds: 1,
        };
        let (record, worker) = claim(&f.store, task.spec()).await;
        let id = record.id.clone();

        f.runtime.execute(record, worker).await.unwrap();
        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.broken_reason.as_deref(), Some("missing_blob"));
    }

    #[tokio::test]
    async fn failures_become_error_with_log_and_panics_are_caught() {
        let f = fixture();
        let spec = Explode {}.spec();

        // attempt 1: plain failure
        let (record, worker) = claim(&f.store, spec.clone()).await;
        let id = record.id.clone();
        assert_eq!(f.runtime.execute(record, worker).await.unwrap(), Execution::Errored);
        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(
            stored.error.as_deref(),
            Some("ServiceUnavailable: converter returned 503")
        );
        assert_eq!(stored.log.as_deref(), Some("about to fail\n"));

        // attempt 2: a broken reason the function never declared
        f.store
            .retry(
                &RetrySelection::Ids(vec![id.clone()]),
                RetryCascade::None,
                Utc::now(),
            )
            .await
            .unwrap();
        let mut record = f.store.claim(&id, worker, Utc::now()).await.unwrap().unwrap();
        // retry resets attempts; force the second branch
        record.attempts = 2;
        assert_eq!(f.runtime.execute(record, worker).await.unwrap(), Execution::Errored);
        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert!(stored.error.unwrap().starts_with("UndeclaredBrokenReason: not_declared"));

        // attempt 3: panic
        f.store
            .retry(
                &RetrySelection::Ids(vec![id.clone()]),
                RetryCascade::None,
                Utc::now(),
            )
            .await
            .unwrap();
        let mut record = f.store.claim(&id, worker, Utc::now()).await.unwrap().unwrap();
        record.attempts = 3;
        assert_eq!(f.runtime.execute(record, worker).await.unwrap(), Execution::Errored);
        let stored = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("panic: boom"));
    }

    #[tokio::test]
    async fn report_after_reclaim_is_a_lost_claim() {
        let f = fixture();
        let task = Echo {
            text: "late".into(),
        };
        let (record, _owner) = claim(&f.store, task.spec()).await;

        let outcome = f
            .runtime
            .execute(record, WorkerId::generate())
            .await
            .unwrap();
        assert_eq!(outcome, Execution::LostClaim);
    }
}
