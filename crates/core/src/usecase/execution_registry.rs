use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::job::{JobId, Stage};
use crate::infra::process::ProcessTracker;

/// 実行中（または実行待ち）ジョブ1件分の制御ハンドル。
///
/// キャンセルトークン・外部プロセス・tokio タスクの3経路で停止できる。
/// 終端処理（ステータス書き込みとワークスペース解放）は `finish_with` で
/// 最初に到達した1者だけが行う。
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    job_id: JobId,
    token: CancellationToken,
    processes: ProcessTracker,
    task: Mutex<Option<AbortHandle>>,
    terminal: Mutex<Option<Stage>>,
}

impl ExecutionHandle {
    pub fn new(job_id: JobId) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                job_id,
                token: CancellationToken::new(),
                processes: ProcessTracker::new(),
                task: Mutex::new(None),
                terminal: Mutex::new(None),
            }),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.inner.job_id
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn processes(&self) -> &ProcessTracker {
        &self.inner.processes
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// ワーカータスクを紐付ける。既にキャンセル済みなら即 abort する。
    pub fn attach_task(&self, task: AbortHandle) {
        let mut slot = self.inner.task.lock();
        if self.inner.token.is_cancelled() {
            task.abort();
            return;
        }
        *slot = Some(task);
    }

    /// トークンを立て、外部プロセスグループを kill し、タスクを abort する。
    /// kill したプロセスグループ数を返す。
    pub fn terminate(&self) -> usize {
        let mut slot = self.inner.task.lock();
        self.inner.token.cancel();
        let killed = self.inner.processes.terminate_all();
        if let Some(task) = slot.take() {
            task.abort();
        }
        killed
    }

    /// 終端ステージを確定させ、確定できた場合のみ `f` を実行する。
    ///
    /// `f` は確定ロックの内側で走るので、終端処理は必ず1回だけになる。
    /// 既に確定済みなら、そのステージを `Err` で返す。
    pub fn finish_with<R>(&self, stage: Stage, f: impl FnOnce() -> R) -> Result<R, Stage> {
        let mut terminal = self.inner.terminal.lock();
        if let Some(existing) = *terminal {
            return Err(existing);
        }
        let result = f();
        *terminal = Some(stage);
        Ok(result)
    }

    /// 終端が未確定の間だけ `f` を実行する。確定済みなら `None`。
    pub fn if_live<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let terminal = self.inner.terminal.lock();
        if terminal.is_some() {
            return None;
        }
        Some(f())
    }

    pub fn terminal_stage(&self) -> Option<Stage> {
        *self.inner.terminal.lock()
    }
}

/// JobId → ExecutionHandle の対応表。ハンドルはジョブが終端に達するまでだけ存在する。
#[derive(Default)]
pub struct ExecutionRegistry {
    handles: DashMap<JobId, ExecutionHandle>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ExecutionHandle) {
        let job_id = handle.job_id().clone();
        if self.handles.insert(job_id.clone(), handle).is_some() {
            log::warn!("Replaced an existing execution handle for job {job_id}");
        }
    }

    pub fn lookup(&self, job_id: &JobId) -> Option<ExecutionHandle> {
        self.handles.get(job_id).map(|entry| entry.value().clone())
    }

    /// ハンドルを取り除いて返す。同じ JobId に対して `Some` を受け取るのは1回だけ。
    pub fn unregister(&self, job_id: &JobId) -> Option<ExecutionHandle> {
        self.handles.remove(job_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.handles.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.handles.iter().map(|entry| entry.key().clone()).collect()
    }
}
