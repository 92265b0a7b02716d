//! Engine - エンジン操作の入口
//!
//! ストア・blob 置き場・時計・登録済み Handler・設定をまとめて持ち、
//! 投入 / 再実行 / 統計 / ワーカー起動を提供する。
//! グローバルな状態は持たず、必要なものは全てここから渡す。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::reaper_loop::ReaperLoop;
use super::resolver::Resolver;
use super::runtime::{ExecutionLimits, Runtime};
use super::stats_loop::{StatsLoop, latest_snapshot};
use super::status::StatsSnapshot;
use super::worker_loop::{StepOutcome, Worker, WorkerGroup};
use crate::config::EngineConfig;
use crate::domain::{BlobId, Dependency, NewTask, TaskId, TaskRecord, TaskSpec};
use crate::error::LoomError;
use crate::ports::{BlobError, BlobStore, Clock, StoreError, Submitted, TaskFilter, TaskStore};
use crate::queue::{RetryCascade, RetrySelection};
use crate::typed::{Task, TypedRegistry};

pub struct Engine {
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    resolver: Arc<Resolver>,
    runtime: Arc<Runtime>,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<TypedRegistry>,
        config: EngineConfig,
    ) -> Self {
        let resolver = Arc::new(Resolver::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.batch_size,
        ));
        let limits = ExecutionLimits {
            heartbeat_interval: config.heartbeat_interval(),
            max_error_len: config.max_error_len,
            max_log_len: config.max_log_len,
        };
        let runtime = Arc::new(Runtime::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            registry,
            Arc::clone(&clock),
            limits,
        ));
        Self {
            store,
            blobs,
            clock,
            config,
            resolver,
            runtime,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypedRegistry {
        self.runtime.registry()
    }

    /// Idempotent: the same `(function, args)` always maps to the same task.
    pub async fn submit(
        &self,
        spec: TaskSpec,
        dependencies: Vec<Dependency>,
    ) -> Result<TaskId, StoreError> {
        let Submitted { id, created } = self
            .store
            .submit(NewTask::new(spec, dependencies), self.clock.now())
            .await?;
        if created {
            tracing::info!(task_id = %id, "task submitted");
        } else {
            tracing::debug!(task_id = %id, "task already exists");
        }
        Ok(id)
    }

    pub async fn submit_task<T: Task>(
        &self,
        task: &T,
        dependencies: Vec<Dependency>,
    ) -> Result<TaskId, StoreError> {
        self.submit(task.spec(), dependencies).await
    }

    pub async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        filter: &TaskFilter,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.store.list(filter, limit).await
    }

    /// Re-arm failed tasks with the configured cascade policy.
    /// Returns how many tasks were re-armed.
    pub async fn retry(&self, selection: &RetrySelection) -> Result<usize, StoreError> {
        Ok(self
            .retry_with(selection, self.config.retry_cascade)
            .await?
            .len())
    }

    pub async fn retry_with(
        &self,
        selection: &RetrySelection,
        cascade: RetryCascade,
    ) -> Result<Vec<TaskId>, StoreError> {
        let rearmed = self
            .store
            .retry(selection, cascade, self.clock.now())
            .await?;
        tracing::info!(count = rearmed.len(), cascade = ?cascade, "tasks re-armed");
        Ok(rearmed)
    }

    pub async fn put_blob(&self, bytes: Vec<u8>) -> Result<BlobId, BlobError> {
        self.blobs.put(bytes).await
    }

    pub async fn get_blob(&self, id: &BlobId) -> Result<Vec<u8>, BlobError> {
        self.blobs.get(id).await
    }

    /// Fresh snapshot, not stored.
    pub async fn stats(&self) -> Result<StatsSnapshot, StoreError> {
        self.stats_loop().compute().await
    }

    /// The snapshot last stored by a stats loop (possibly another process).
    pub async fn latest_stats(&self) -> Result<Option<StatsSnapshot>, LoomError> {
        latest_snapshot(self.store.as_ref()).await
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.resolver),
            Arc::clone(&self.runtime),
            Arc::clone(&self.clock),
        )
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.liveness_timeout(),
            self.config.reclaim_policy(),
        )
    }

    pub fn stats_loop(&self) -> StatsLoop {
        StatsLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.stats_window(),
            self.config.top_error_types,
        )
    }

    /// Run tasks on the calling task until nothing is claimable.
    /// Returns how many attempts were executed.
    pub async fn run_until_idle(&self) -> Result<usize, StoreError> {
        let worker = self.worker();
        let mut ran = 0;
        while let StepOutcome::Ran { .. } = worker.step().await? {
            ran += 1;
        }
        Ok(ran)
    }

    /// Spawn `workers` executors plus the reaper and the stats loop.
    pub fn start(&self) -> EngineHandle {
        let workers = WorkerGroup::spawn(
            (0..self.config.workers).map(|_| self.worker()).collect(),
            self.config.sweep_interval(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = tokio::spawn(
            self.reaper()
                .run(self.config.reaper_interval(), shutdown_rx.clone()),
        );
        let stats = tokio::spawn(
            self.stats_loop()
                .run(self.config.stats_interval(), shutdown_rx),
        );
        tracing::info!(workers = workers.len(), "engine started");

        EngineHandle {
            workers,
            shutdown_tx,
            background: vec![reaper, stats],
        }
    }
}

/// Running engine. Dropping it without `shutdown` leaves the loops running.
pub struct EngineHandle {
    workers: WorkerGroup,
    shutdown_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop claiming, let in-flight bodies finish, then stop the reaper and stats loop.
    pub async fn shutdown(self) {
        self.workers.shutdown_and_join().await;
        let _ = self.shutdown_tx.send(true);
        for join in self.background {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "background loop ended abnormally");
            }
        }
        tracing::info!("engine stopped");
    }
}
