//! Resolver - 依存関係の定期スイープ
//!
//! 1 回のスイープで以下を行う：
//! 1. 上流が broken/error の待機タスクを broken にする（下流へ伝播）
//! 2. 依存が全て success になった deferred タスクを pending に戻す
//! 3. claim 可能な pending タスクの id を返す
//!
//! 通知ではなくポーリングなので、前提タスクの success から
//! 次のスイープまで（sweep_interval）が拾われるまでの遅延の上限になる。

use std::sync::Arc;

use crate::domain::TaskId;
use crate::ports::{Candidates, Clock, StoreError, TaskStore};
use crate::queue::Readiness;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks a worker may try to claim now.
    pub ready: Vec<TaskId>,
    /// `deferred -> pending` transitions.
    pub promoted: usize,
    /// Tasks broken because a prerequisite failed (including transitive ones).
    pub broken: usize,
}

pub struct Resolver {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl Resolver {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, batch_size: usize) -> Self {
        Self {
            store,
            clock,
            batch_size,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for id in self
            .store
            .find(Candidates::UpstreamFailed, self.batch_size, now)
            .await?
        {
            let incoming = self.store.dependencies(&id).await?;
            let readiness = Readiness::evaluate(incoming.iter().map(|(edge, s)| (edge, *s)));
            if let Readiness::UpstreamFailed { prev, edge } = readiness {
                let broken = self.store.break_upstream(&id, &prev, now).await?;
                if !broken.is_empty() {
                    tracing::info!(task_id = %id, cause = %prev, edge = %edge, count = broken.len(), "upstream failure propagated");
                }
                report.broken += broken.len();
            }
        }

        for id in self
            .store
            .find(Candidates::DeferredSatisfied, self.batch_size, now)
            .await?
        {
            if self.store.promote_deferred(&id, now).await? {
                tracing::debug!(task_id = %id, "deferred task promoted");
                report.promoted += 1;
            }
        }

        report.ready = self
            .store
            .find(Candidates::Ready, self.batch_size, now)
            .await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::domain::{Dependency, Failure, NewTask, Requirement, TaskSpec, TaskStatus, WorkerId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::SystemClock;

    fn resolver(store: &Arc<InMemoryTaskStore>) -> Resolver {
        Resolver::new(store.clone(), Arc::new(SystemClock), 32)
    }

    async fn submit(store: &InMemoryTaskStore, function: &str, deps: &[&TaskId]) -> TaskId {
        let dependencies = deps
            .iter()
            .map(|prev| Dependency::new((*prev).clone(), "input"))
            .collect();
        store
            .submit(NewTask::new(TaskSpec::new(function, vec![]), dependencies), Utc::now())
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn only_roots_are_ready_at_first() {
        let store = Arc::new(InMemoryTaskStore::new());
        let a = submit(&store, "a", &[]).await;
        let _b = submit(&store, "b", &[&a]).await;

        let report = resolver(&store).sweep().await.unwrap();
        assert_eq!(report.ready, vec![a]);
    }

    #[tokio::test]
    async fn deferred_task_returns_when_requirement_succeeds() {
        let store = Arc::new(InMemoryTaskStore::new());
        let a = submit(&store, "a", &[]).await;
        let worker = WorkerId::generate();
        store.claim(&a, worker, Utc::now()).await.unwrap().unwrap();
        let need = TaskSpec::new("need", vec![]);
        store
            .defer(
                &a,
                worker,
                vec![Requirement {
                    name: "config".into(),
                    spec: need.clone(),
                }],
                Utc::now(),
            )
            .await
            .unwrap();

        let resolver = resolver(&store);
        let report = resolver.sweep().await.unwrap();
        assert_eq!(report.ready, vec![need.id()]);
        assert_eq!(report.promoted, 0);

        store.claim(&need.id(), worker, Utc::now()).await.unwrap().unwrap();
        store
            .complete(&need.id(), worker, None, vec![], Utc::now())
            .await
            .unwrap();

        let report = resolver.sweep().await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.ready, vec![a.clone()]);
        assert_eq!(
            store.get(&a).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn deferred_task_breaks_when_requirement_fails() {
        let store = Arc::new(InMemoryTaskStore::new());
        let a = submit(&store, "a", &[]).await;
        let worker = WorkerId::generate();
        store.claim(&a, worker, Utc::now()).await.unwrap().unwrap();
        let need = TaskSpec::new("need", vec![]);
        store
            .defer(
                &a,
                worker,
                vec![Requirement {
                    name: "config".into(),
                    spec: need.clone(),
                }],
                Utc::now(),
            )
            .await
            .unwrap();

        store.claim(&need.id(), worker, Utc::now()).await.unwrap().unwrap();
        store
            .fail(
                &need.id(),
                worker,
                Failure::broken("no_config", "missing"),
                Utc::now(),
            )
            .await
            .unwrap();

        // fail() already propagates; the sweep finds nothing left to break
        let report = resolver(&store).sweep().await.unwrap();
        assert_eq!(report.broken, 0);
        let record = store.get(&a).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Broken);
        assert_eq!(
            record.broken_reason.as_deref(),
            Some("upstream_dependency_failed")
        );
    }
}
