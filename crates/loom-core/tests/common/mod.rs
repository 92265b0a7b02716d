//! Shared harness for engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use loom_core::app::{Engine, EngineBuilder};
use loom_core::config::EngineConfig;
use loom_core::domain::{Arg, BlobId, Dependency, TaskError, TaskId, TaskRecord};
use loom_core::impls::{InMemoryBlobStore, InMemoryTaskStore, LibSqlTaskStore};
use loom_core::ports::{FixedClock, TaskStore};
use loom_core::typed::{Handler, Task, TaskContext};

#[derive(Debug, Clone, Copy)]
pub enum StoreKind {
    Memory,
    LibSql,
}

pub async fn open_store(kind: StoreKind) -> Arc<dyn TaskStore> {
    match kind {
        StoreKind::Memory => Arc::new(InMemoryTaskStore::new()),
        StoreKind::LibSql => Arc::new(LibSqlTaskStore::open_memory().await.unwrap()),
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

/// Counters the test functions report into.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    /// How many more times `flaky` fails before it succeeds.
    pub flaky_failures: Arc<AtomicU32>,
    /// Executions of `counted`.
    pub executions: Arc<AtomicU32>,
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<dyn TaskStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub clock: Arc<FixedClock>,
    pub counters: Counters,
}

impl Harness {
    pub async fn record(&self, id: &TaskId) -> TaskRecord {
        self.store.get(id).await.unwrap().unwrap()
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_attempts: 3,
        liveness_timeout_secs: 60,
        heartbeat_interval_secs: 10,
        ..Default::default()
    }
}

pub async fn harness(kind: StoreKind) -> Harness {
    harness_with(kind, test_config()).await
}

pub async fn harness_with(kind: StoreKind, config: EngineConfig) -> Harness {
    let store = open_store(kind).await;
    let blobs = Arc::new(InMemoryBlobStore::new());
    let clock = Arc::new(FixedClock::new(t0()));
    let counters = Counters::default();

    let engine = EngineBuilder::new(store.clone(), blobs.clone())
        .config(config)
        .clock(clock.clone())
        .register::<Extract, _>(ExtractHandler)
        .unwrap()
        .register::<Convert, _>(ConvertHandler)
        .unwrap()
        .register::<Noop, _>(NoopHandler)
        .unwrap()
        .register::<Breaker, _>(BreakerHandler)
        .unwrap()
        .register::<Flaky, _>(FlakyHandler {
            failures_left: counters.flaky_failures.clone(),
        })
        .unwrap()
        .register::<Counted, _>(CountedHandler {
            executions: counters.executions.clone(),
        })
        .unwrap()
        .register::<Requires, _>(RequiresHandler)
        .unwrap()
        .register::<Siblings, _>(SiblingsHandler)
        .unwrap()
        .expect_functions(&[
            Extract::FUNCTION,
            Convert::FUNCTION,
            Noop::FUNCTION,
            Breaker::FUNCTION,
            Flaky::FUNCTION,
            Counted::FUNCTION,
            Requires::FUNCTION,
            Siblings::FUNCTION,
        ])
        .build()
        .unwrap();

    Harness {
        engine,
        store,
        blobs,
        clock,
        counters,
    }
}

/// Stores the reversed input and spawns a `convert` of it.
#[derive(Debug, Clone, Deserialize)]
pub struct Extract {
    pub file: BlobId,
}

impl Task for Extract {
    const FUNCTION: &'static str = "extract";

    fn args(&self) -> Vec<Arg> {
        vec![Arg::blob(self.file.clone())]
    }
}

pub struct ExtractHandler;

#[async_trait]
impl Handler<Extract> for ExtractHandler {
    async fn handle(
        &self,
        task: Extract,
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        let mut bytes = ctx.read_blob(&task.file).await?;
        bytes.reverse();
        let result = ctx.put_blob(bytes).await?;
        ctx.spawn(
            "parent-extracted",
            Convert {
                input: result.clone(),
            }
            .spec(),
        );
        Ok(Some(result))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Convert {
    pub input: BlobId,
}

impl Task for Convert {
    const FUNCTION: &'static str = "convert";

    fn args(&self) -> Vec<Arg> {
        vec![Arg::blob(self.input.clone())]
    }
}

pub struct ConvertHandler;

#[async_trait]
impl Handler<Convert> for ConvertHandler {
    async fn handle(
        &self,
        task: Convert,
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        let bytes = ctx.read_blob(&task.input).await?;
        Ok(Some(ctx.put_blob(bytes.to_ascii_uppercase()).await?))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Noop {
    pub tag: String,
}

impl Task for Noop {
    const FUNCTION: &'static str = "noop";

    fn args(&self) -> Vec<Arg> {
        vec![Arg::value(self.tag.clone())]
    }
}

pub fn noop(tag: &str) -> Noop {
    Noop { tag: tag.into() }
}

pub struct NoopHandler;

#[async_trait]
impl Handler<Noop> for NoopHandler {
    async fn handle(&self, _task: Noop, _ctx: &mut TaskContext) -> Result<Option<BlobId>, TaskError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Breaker {
    pub tag: String,
}

impl Task for Breaker {
    const FUNCTION: &'static str = "breaker";
    const BROKEN_REASONS: &'static [&'static str] = &["bad_input"];

    fn args(&self) -> Vec<Arg> {
        vec![Arg::value(self.tag.clone())]
    }
}

pub struct BreakerHandler;

#[async_trait]
impl Handler<Breaker> for BreakerHandler {
    async fn handle(
        &self,
        task: Breaker,
        _ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        Err(TaskError::broken("bad_input", format!("{} is corrupt", task.tag)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flaky {
    pub tag: String,
}

impl Task for Flaky {
    const FUNCTION: &'static str = "flaky";

    fn args(&self) -> Vec<Arg> {
        vec![Arg::value(self.tag.clone())]
    }
}

pub fn flaky(tag: &str) -> Flaky {
    Flaky { tag: tag.into() }
}

pub struct FlakyHandler {
    failures_left: Arc<AtomicU32>,
}

#[async_trait]
impl Handler<Flaky> for FlakyHandler {
    async fn handle(&self, _task: Flaky, ctx: &mut TaskContext) -> Result<Option<BlobId>, TaskError> {
        ctx.log(format!("attempt {}", ctx.attempt()));
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(TaskError::failed("ServiceUnavailable", "converter returned 503"));
        }
        Ok(Some(ctx.put_blob(b"flaky ok".to_vec()).await?))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Counted {
    pub tag: String,
}

impl Task for Counted {
    const FUNCTION: &'static str = "counted";

    fn args(&self) -> Vec<Arg> {
        vec![Arg::value(self.tag.clone())]
    }
}

pub struct CountedHandler {
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl Handler<Counted> for CountedHandler {
    async fn handle(
        &self,
        _task: Counted,
        _ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(None)
    }
}

/// Needs `noop("<tag>-dep")` at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Requires {
    pub tag: String,
}

impl Task for Requires {
    const FUNCTION: &'static str = "requires";

    fn args(&self) -> Vec<Arg> {
        vec![Arg::value(self.tag.clone())]
    }
}

pub struct RequiresHandler;

#[async_trait]
impl Handler<Requires> for RequiresHandler {
    async fn handle(
        &self,
        task: Requires,
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        let dep = noop(&format!("{}-dep", task.tag));
        ctx.require("needs-noop", dep.spec()).await?;
        Ok(Some(ctx.put_blob(task.tag.into_bytes()).await?))
    }
}

/// Spawns `noop("<tag>-first")` waiting on `noop("<tag>-second")`, listed
/// before it. With `cyclic`, the second also waits on the first.
#[derive(Debug, Clone, Deserialize)]
pub struct Siblings {
    pub tag: String,
    pub cyclic: bool,
}

impl Siblings {
    pub fn children(&self) -> (TaskId, TaskId) {
        (
            noop(&format!("{}-first", self.tag)).spec().id(),
            noop(&format!("{}-second", self.tag)).spec().id(),
        )
    }
}

impl Task for Siblings {
    const FUNCTION: &'static str = "siblings";

    fn args(&self) -> Vec<Arg> {
        vec![Arg::value(self.tag.clone()), Arg::value(self.cyclic)]
    }
}

pub struct SiblingsHandler;

#[async_trait]
impl Handler<Siblings> for SiblingsHandler {
    async fn handle(
        &self,
        task: Siblings,
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        let (first, second) = task.children();
        let parent = Dependency::new(ctx.id().clone(), "parent");
        ctx.spawn_with(
            noop(&format!("{}-first", task.tag)).spec(),
            vec![parent.clone(), Dependency::new(second, "after-second")],
        );
        let mut deps = vec![parent];
        if task.cyclic {
            deps.push(Dependency::new(first, "after-first"));
        }
        ctx.spawn_with(noop(&format!("{}-second", task.tag)).spec(), deps);
        Ok(None)
    }
}
