//! TaskContext - 実行中のタスク本体に渡されるコンテキスト
//!
//! Blob の遅延読み込み、子タスクの生成、実行時の依存要求、ログ出力を提供します。
//! 子タスクと依存要求はここに溜めておき、報告時に親の状態更新と
//! 同じトランザクションで書き込まれます。

use std::sync::Arc;

use crate::domain::{
    Arg, BlobId, Dependency, NewTask, Requirement, TaskError, TaskId, TaskRecord, TaskSpec,
    TaskStatus, reason,
};
use crate::ports::{BlobStore, TaskStore};

/// Side effects a task body queued up for its report.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub children: Vec<NewTask>,
    pub requirements: Vec<Requirement>,
    pub log: String,
}

pub struct TaskContext {
    record: TaskRecord,
    blobs: Arc<dyn BlobStore>,
    store: Arc<dyn TaskStore>,
    effects: Effects,
}

impl TaskContext {
    pub(crate) fn new(
        record: TaskRecord,
        blobs: Arc<dyn BlobStore>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            record,
            blobs,
            store,
            effects: Effects::default(),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.record.id
    }

    /// The claimed record, as it was when this attempt started.
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    /// 1 on the first attempt.
    pub fn attempt(&self) -> u32 {
        self.record.attempts
    }

    pub fn args(&self) -> &[Arg] {
        &self.record.args
    }

    /// Bytes of the blob passed as argument `index`.
    pub async fn blob(&self, index: usize) -> Result<Vec<u8>, TaskError> {
        match self.record.args.get(index) {
            Some(Arg::Blob(id)) => self.read_blob(id).await,
            Some(Arg::Value(_)) => Err(TaskError::broken(
                reason::INVALID_ARGUMENTS,
                format!("argument {index} is a value, not a blob"),
            )),
            None => Err(TaskError::broken(
                reason::INVALID_ARGUMENTS,
                format!("no argument at index {index}"),
            )),
        }
    }

    pub async fn read_blob(&self, id: &BlobId) -> Result<Vec<u8>, TaskError> {
        Ok(self.blobs.get(id).await?)
    }

    pub async fn put_blob(&self, bytes: Vec<u8>) -> Result<BlobId, TaskError> {
        Ok(self.blobs.put(bytes).await?)
    }

    /// Queue a child task that runs after this one succeeds.
    ///
    /// The child gets an edge `this -> child` named `name`. Nothing is
    /// written unless this task completes successfully.
    pub fn spawn(&mut self, name: impl Into<String>, spec: TaskSpec) -> TaskId {
        let dependency = Dependency::new(self.record.id.clone(), name);
        self.spawn_with(spec, vec![dependency])
    }

    /// Queue a child task with explicit dependencies (which may include this task).
    pub fn spawn_with(&mut self, spec: TaskSpec, dependencies: Vec<Dependency>) -> TaskId {
        let child = NewTask::new(spec, dependencies);
        let id = child.id();
        self.effects.children.push(child);
        id
    }

    /// Require another task's result.
    ///
    /// Returns its result if it already succeeded. If it failed, this task
    /// becomes broken too. Otherwise the requirement is recorded and
    /// `TaskError::Deferred` is returned: propagate it with `?` and the task
    /// runs again once the requirement succeeds.
    pub async fn require(
        &mut self,
        name: impl Into<String>,
        spec: TaskSpec,
    ) -> Result<Option<BlobId>, TaskError> {
        let name = name.into();
        let id = spec.id();
        let existing = self
            .store
            .get(&id)
            .await
            .map_err(|e| TaskError::failed("store", e.to_string()))?;

        match existing {
            Some(record) if record.status == TaskStatus::Success => Ok(record.result),
            Some(record) if record.status.is_failed() => Err(TaskError::broken(
                reason::UPSTREAM_DEPENDENCY_FAILED,
                format!("required task {id} ({name}) is {}", record.status),
            )),
            _ => {
                self.effects.requirements.push(Requirement { name, spec });
                Err(TaskError::Deferred)
            }
        }
    }

    /// Append a line to this attempt's log (kept if the attempt ends in error).
    pub fn log(&mut self, line: impl AsRef<str>) {
        self.effects.log.push_str(line.as_ref());
        self.effects.log.push('\n');
    }

    pub(crate) fn into_effects(self) -> Effects {
        self.effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryBlobStore, InMemoryTaskStore};
    use crate::domain::WorkerId;
    use chrono::Utc;

    async fn running_context(store: Arc<InMemoryTaskStore>, args: Vec<Arg>) -> TaskContext {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let spec = TaskSpec::new("parent", args);
        let id = store.submit(NewTask::new(spec, vec![]), Utc::now()).await.unwrap().id;
        let record = store
            .claim(&id, WorkerId::generate(), Utc::now())
            .await
            .unwrap()
            .unwrap();
        TaskContext::new(record, blobs, store)
    }

    #[tokio::test]
    async fn spawn_links_child_to_parent() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut ctx = running_context(store, vec![]).await;
        let parent = ctx.id().clone();

        let child = ctx.spawn("parent-extracted", TaskSpec::new("child", vec![]));
        let effects = ctx.into_effects();

        assert_eq!(effects.children.len(), 1);
        assert_eq!(effects.children[0].id(), child);
        assert_eq!(
            effects.children[0].dependencies,
            vec![Dependency::new(parent, "parent-extracted")]
        );
    }

    #[tokio::test]
    async fn require_unknown_task_defers() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut ctx = running_context(store, vec![]).await;

        let err = ctx
            .require("config", TaskSpec::new("fetch-config", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Deferred);
        assert_eq!(ctx.into_effects().requirements.len(), 1);
    }

    #[tokio::test]
    async fn blob_argument_is_loaded_lazily() {
        let store = Arc::new(InMemoryTaskStore::new());
        let blobs = InMemoryBlobStore::new();
        let id = blobs.put(b"contents".to_vec()).await.unwrap();
        let mut ctx = running_context(store, vec![Arg::blob(id), Arg::value(1)]).await;
        ctx.blobs = Arc::new(blobs);

        assert_eq!(ctx.blob(0).await.unwrap(), b"contents");
        assert!(matches!(
            ctx.blob(1).await,
            Err(TaskError::Broken { ref reason, .. }) if reason == "invalid_arguments"
        ));
        assert!(ctx.blob(7).await.is_err());
    }

    #[tokio::test]
    async fn log_lines_accumulate() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut ctx = running_context(store, vec![]).await;
        ctx.log("first");
        ctx.log(String::from("second"));
        assert_eq!(ctx.into_effects().log, "first\nsecond\n");
    }
}
