//! StatsLoop - 統計スナップショットの定期計算
//!
//! 集計は重いのでリクエスト毎ではなく定期的に行い、
//! 結果を TaskStore の stats テーブルに保存する（他プロセスの CLI が読む）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::status::{STATS_KEY, StatsSnapshot, estimate};
use crate::error::LoomError;
use crate::ports::{Clock, StoreError, TaskStore, earlier};

pub struct StatsLoop {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    top_error_types: usize,
}

impl StatsLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        window: Duration,
        top_error_types: usize,
    ) -> Self {
        Self {
            store,
            clock,
            window,
            top_error_types,
        }
    }

    /// Compute a snapshot without storing it.
    pub async fn compute(&self) -> Result<StatsSnapshot, StoreError> {
        let now = self.clock.now();
        let rows = self.store.stats_rows(earlier(now, self.window)).await?;
        Ok(estimate(rows, self.window, self.top_error_types, now))
    }

    /// Compute a snapshot and store it under `STATS_KEY`.
    pub async fn snapshot_once(&self) -> Result<StatsSnapshot, LoomError> {
        let snapshot = self.compute().await?;
        let value = serde_json::to_value(&snapshot)?;
        self.store
            .put_stat(STATS_KEY, value, snapshot.taken_at)
            .await?;
        tracing::debug!(progress = %snapshot.progress_str, "stats snapshot stored");
        Ok(snapshot)
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
                    match self.snapshot_once().await {
                        Ok(snapshot) => tracing::info!(progress = %snapshot.progress_str, "progress"),
                        Err(e) => tracing::error!(error = %e, "stats snapshot failed"),
                    }
                }
            }
        }
        tracing::info!("stats loop stopped");
    }
}

/// Read the last stored snapshot, if any.
pub async fn latest_snapshot(store: &dyn TaskStore) -> Result<Option<StatsSnapshot>, LoomError> {
    match store.get_stat(STATS_KEY).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}
