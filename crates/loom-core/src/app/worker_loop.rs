//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. Resolver::sweep() で ready な task_id を取得
//! 2. シャッフルした順に TaskStore::claim() を試す（負けたら次の候補へ）
//! 3. claim できたら Runtime::execute() で実行して報告
//! 4. 何も claim できなければ sweep_interval（± ジッター）だけ待つ

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::resolver::Resolver;
use super::runtime::{Execution, Runtime};
use crate::domain::{TaskId, WorkerId};
use crate::ports::{Clock, StoreError, TaskStore};

/// Result of one worker step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was claimable.
    Idle,
    Ran { task: TaskId, execution: Execution },
}

/// A single executor. Workers share nothing but the store.
pub struct Worker {
    id: WorkerId,
    store: Arc<dyn TaskStore>,
    resolver: Arc<Resolver>,
    runtime: Arc<Runtime>,
    clock: Arc<dyn Clock>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        resolver: Arc<Resolver>,
        runtime: Arc<Runtime>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: WorkerId::generate(),
            store,
            resolver,
            runtime,
            clock,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Sweep, claim at most one task and run it.
    pub async fn step(&self) -> Result<StepOutcome, StoreError> {
        let mut ready = self.resolver.sweep().await?.ready;
        // 複数ワーカーが同じ先頭タスクを取り合わないように
        ready.shuffle(&mut rand::thread_rng());

        for id in ready {
            match self.store.claim(&id, self.id, self.clock.now()).await? {
                Some(record) => {
                    tracing::debug!(task_id = %id, worker = %self.id, function = %record.function, attempt = record.attempts, "claimed");
                    let execution = self.runtime.execute(record, self.id).await?;
                    return Ok(StepOutcome::Ran {
                        task: id,
                        execution,
                    });
                }
                None => {
                    tracing::debug!(task_id = %id, worker = %self.id, "claim lost to another worker");
                }
            }
        }
        Ok(StepOutcome::Idle)
    }
}

/// Worker group handle.
/// - `request_shutdown()` で新しい claim を止める（実行中の本体は最後まで走る）
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn one loop per worker.
    pub fn spawn(workers: Vec<Worker>, idle_delay: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = workers
            .into_iter()
            .map(|worker| {
                let rx = shutdown_rx.clone();
                tokio::spawn(worker_loop(worker, idle_delay, rx))
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(worker: Worker, idle_delay: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    tracing::info!(worker = %worker.id(), "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match worker.step().await {
            Ok(StepOutcome::Ran { .. }) => continue,
            Ok(StepOutcome::Idle) => {}
            Err(e) => tracing::error!(worker = %worker.id(), error = %e, "worker step failed"),
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(jittered(idle_delay)) => {}
        }
    }
    tracing::info!(worker = %worker.id(), "worker stopped");
}

/// `delay` ± 10%.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::app::runtime::ExecutionLimits;
    use crate::domain::{NewTask, TaskStatus};
    use crate::impls::{InMemoryBlobStore, InMemoryTaskStore};
    use crate::ports::SystemClock;
    use crate::typed::handler::fixtures::EchoHandler;
    use crate::typed::task::fixtures::Echo;
    use crate::typed::{Task, TypedRegistry};

    fn worker(store: Arc<InMemoryTaskStore>) -> Worker {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut registry = TypedRegistry::new();
        registry.register::<Echo, _>(EchoHandler).unwrap();
        let runtime = Runtime::new(
            store.clone(),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(registry),
            clock.clone(),
            ExecutionLimits::default(),
        );
        let resolver = Resolver::new(store.clone(), clock.clone(), 8);
        Worker::new(store, Arc::new(resolver), Arc::new(runtime), clock)
    }

    #[tokio::test]
    async fn step_runs_one_task_then_idles() {
        let store = Arc::new(InMemoryTaskStore::new());
        let spec = Echo {
            text: "x".into(),
        }
        .spec();
        let id = store
            .submit(NewTask::new(spec, vec![]), Utc::now())
            .await
            .unwrap()
            .id;

        let worker = worker(store.clone());
        assert_eq!(
            worker.step().await.unwrap(),
            StepOutcome::Ran {
                task: id.clone(),
                execution: Execution::Succeeded
            }
        );
        assert_eq!(worker.step().await.unwrap(), StepOutcome::Idle);
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().status,
            TaskStatus::Success
        );
    }

    #[tokio::test]
    async fn group_drains_queue_and_shuts_down() {
        let store = Arc::new(InMemoryTaskStore::new());
        for i in 0..10 {
            let spec = Echo {
                text: format!("msg-{i}"),
            }
            .spec();
            store
                .submit(NewTask::new(spec, vec![]), Utc::now())
                .await
                .unwrap();
        }

        let group = WorkerGroup::spawn(
            (0..3).map(|_| worker(store.clone())).collect(),
            Duration::from_millis(5),
        );
        assert_eq!(group.len(), 3);

        for _ in 0..200 {
            let done = store
                .list(&Default::default(), 100)
                .await
                .unwrap()
                .iter()
                .all(|r| r.status == TaskStatus::Success);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        group.shutdown_and_join().await;

        let records = store.list(&Default::default(), 100).await.unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.status == TaskStatus::Success && r.attempts == 1));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(899) && d <= Duration::from_millis(1101));
        }
    }
}
