//! Operator retry and its cascade policies.

mod common;

use std::sync::atomic::Ordering;

use rstest::rstest;

use loom_core::domain::{Dependency, TaskStatus, reason};
use loom_core::queue::{RetryCascade, RetrySelection};

use common::{StoreKind, flaky, harness, noop};

#[rstest]
#[case::in_memory(StoreKind::Memory)]
#[case::libsql(StoreKind::LibSql)]
#[tokio::test]
async fn retried_task_starts_from_a_clean_record(#[case] kind: StoreKind) {
    let h = harness(kind).await;
    h.counters.flaky_failures.store(1, Ordering::SeqCst);
    let id = h.engine.submit_task(&flaky("once"), vec![]).await.unwrap();

    h.engine.run_until_idle().await.unwrap();
    let failed = h.record(&id).await;
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.error.is_some());
    assert!(failed.log.is_some());
    let first_start = failed.date_started.unwrap();

    h.clock.advance(chrono::Duration::seconds(30));
    let rearmed = h
        .engine
        .retry(&RetrySelection::Ids(vec![id.clone()]))
        .await
        .unwrap();
    assert_eq!(rearmed, 1);

    let pending = h.record(&id).await;
    assert_eq!(pending.status, TaskStatus::Pending);
    assert_eq!(pending.attempts, 0);
    assert!(pending.error.is_none());
    assert!(pending.log.is_none());
    assert!(pending.result.is_none());
    assert!(pending.worker.is_none());
    assert!(pending.date_started.is_none());
    assert!(pending.date_finished.is_none());

    h.clock.advance(chrono::Duration::seconds(30));
    h.engine.run_until_idle().await.unwrap();
    let done = h.record(&id).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert!(done.result.is_some());
    assert!(done.date_started.unwrap() > first_start);
    assert_eq!(done.attempts, 1);
}

#[rstest]
#[case::in_memory(StoreKind::Memory)]
#[case::libsql(StoreKind::LibSql)]
#[tokio::test]
async fn retry_ignores_tasks_that_did_not_fail(#[case] kind: StoreKind) {
    let h = harness(kind).await;
    let id = h.engine.submit_task(&noop("fine"), vec![]).await.unwrap();
    h.engine.run_until_idle().await.unwrap();

    let rearmed = h
        .engine
        .retry(&RetrySelection::Ids(vec![id.clone()]))
        .await
        .unwrap();
    assert_eq!(rearmed, 0);
    assert_eq!(h.record(&id).await.status, TaskStatus::Success);
}

/// `a` errors once, `b` waits on `a`.
async fn failed_chain(h: &common::Harness) -> (loom_core::domain::TaskId, loom_core::domain::TaskId) {
    h.counters.flaky_failures.store(1, Ordering::SeqCst);
    let a = h.engine.submit_task(&flaky("a"), vec![]).await.unwrap();
    let b = h
        .engine
        .submit_task(&noop("b"), vec![Dependency::new(a.clone(), "after")])
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();
    assert_eq!(h.record(&a).await.status, TaskStatus::Error);
    assert_eq!(h.record(&b).await.status, TaskStatus::Broken);
    (a, b)
}

#[rstest]
#[case::in_memory(StoreKind::Memory)]
#[case::libsql(StoreKind::LibSql)]
#[tokio::test]
async fn retry_without_cascade_leaves_dependents_broken(#[case] kind: StoreKind) {
    let h = harness(kind).await;
    let (a, b) = failed_chain(&h).await;

    let rearmed = h
        .engine
        .retry_with(&RetrySelection::Ids(vec![a.clone()]), RetryCascade::None)
        .await
        .unwrap();
    assert_eq!(rearmed, vec![a.clone()]);

    h.engine.run_until_idle().await.unwrap();
    assert_eq!(h.record(&a).await.status, TaskStatus::Success);
    let b_record = h.record(&b).await;
    assert_eq!(b_record.status, TaskStatus::Broken);
    assert_eq!(
        b_record.broken_reason.as_deref(),
        Some(reason::UPSTREAM_DEPENDENCY_FAILED)
    );

    // The operator can still re-arm it explicitly.
    h.engine
        .retry_with(&RetrySelection::Ids(vec![b.clone()]), RetryCascade::None)
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();
    assert_eq!(h.record(&b).await.status, TaskStatus::Success);
}

#[rstest]
#[case::in_memory(StoreKind::Memory)]
#[case::libsql(StoreKind::LibSql)]
#[tokio::test]
async fn propagated_retry_rearms_upstream_broken_dependents(#[case] kind: StoreKind) {
    let h = harness(kind).await;
    let (a, b) = failed_chain(&h).await;

    let rearmed = h
        .engine
        .retry_with(&RetrySelection::Function("flaky".into()), RetryCascade::Propagated)
        .await
        .unwrap();
    assert_eq!(rearmed.len(), 2);
    assert!(rearmed.contains(&a) && rearmed.contains(&b));
    assert_eq!(h.record(&b).await.status, TaskStatus::Pending);

    assert_eq!(h.engine.run_until_idle().await.unwrap(), 2);
    assert_eq!(h.record(&a).await.status, TaskStatus::Success);
    assert_eq!(h.record(&b).await.status, TaskStatus::Success);
}

#[rstest]
#[case::in_memory(StoreKind::Memory)]
#[case::libsql(StoreKind::LibSql)]
#[tokio::test]
async fn retry_all_failed_covers_every_function(#[case] kind: StoreKind) {
    let h = harness(kind).await;
    let (a, b) = failed_chain(&h).await;

    let rearmed = h
        .engine
        .retry_with(&RetrySelection::AllFailed, RetryCascade::None)
        .await
        .unwrap();
    assert_eq!(rearmed.len(), 2);

    // `b` is pending again but waits for `a` to succeed first.
    h.engine.run_until_idle().await.unwrap();
    assert_eq!(h.record(&a).await.status, TaskStatus::Success);
    assert_eq!(h.record(&b).await.status, TaskStatus::Success);
}
