//! ReaperLoop - 生存確認切れタスクの回収
//!
//! # フロー
//! 1. date_modified が liveness_timeout より古い running タスクを探す
//! 2. 試行回数が上限未満なら pending に戻す（not_before でバックオフ）
//! 3. 上限に達していたら error（crash loop）にして下流へ伝播

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::ports::{Clock, StoreError, TaskStore, earlier};
use crate::queue::{ReclaimPolicy, ReclaimReport};

pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    liveness_timeout: Duration,
    policy: ReclaimPolicy,
}

impl ReaperLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        liveness_timeout: Duration,
        policy: ReclaimPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            liveness_timeout,
            policy,
        }
    }

    pub async fn reap_once(&self) -> Result<ReclaimReport, StoreError> {
        let now = self.clock.now();
        let stale_before = earlier(now, self.liveness_timeout);
        let report = self
            .store
            .reclaim_stale(stale_before, &self.policy, now)
            .await?;

        for id in &report.requeued {
            tracing::warn!(task_id = %id, "reclaimed stale running task");
        }
        for id in &report.exhausted {
            tracing::warn!(task_id = %id, max_attempts = self.policy.max_attempts, "stale task exceeded attempt limit");
        }
        Ok(report)
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        tracing::error!(error = %e, "reaper pass failed");
                    }
                }
            }
        }
        tracing::info!("reaper stopped");
    }
}
