use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::domain::job::{Stage, StatusExtras};
use crate::domain::stage::{PipelineArtifacts, StageError};
use crate::infra::metrics::Metrics;
use crate::infra::stage::{ProgressSink, StageContext, StageSet};
use crate::infra::workspace::WorkspaceManager;
use crate::usecase::execution_registry::{ExecutionHandle, ExecutionRegistry};
use crate::usecase::status_recorder::{StatusRecorder, StatusUpdate};

/// ジョブ1件の実行結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl JobOutcome {
    fn from_stage(stage: Stage) -> Self {
        match stage {
            Stage::Completed => Self::Completed,
            Stage::Cancelled => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// 5ステージを順に実行し、ステータスを書き込むワーカー
pub struct WorkerExecutor {
    stages: StageSet,
    recorder: Arc<StatusRecorder>,
    registry: Arc<ExecutionRegistry>,
    workspace: Arc<WorkspaceManager>,
    metrics: Arc<Metrics>,
    stage_timeout: Duration,
}

impl WorkerExecutor {
    pub fn new(
        stages: StageSet,
        recorder: Arc<StatusRecorder>,
        registry: Arc<ExecutionRegistry>,
        workspace: Arc<WorkspaceManager>,
        metrics: Arc<Metrics>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            stages,
            recorder,
            registry,
            workspace,
            metrics,
            stage_timeout,
        }
    }

    /// ジョブを最後まで（または最初の失敗・キャンセルまで）実行する
    pub async fn run(&self, handle: &ExecutionHandle, url: String) -> JobOutcome {
        let job_id = handle.job_id().clone();
        let token = handle.token();

        if token.is_cancelled() {
            return self.finish(handle, StatusUpdate::stage(Stage::Cancelled));
        }

        // キャンセル側の release と排他
        let workspace = match handle.if_live(|| self.workspace.allocate(&job_id)) {
            None => return self.finish(handle, StatusUpdate::stage(Stage::Cancelled)),
            Some(Ok(path)) => path,
            Some(Err(e)) => {
                log::error!("Job {job_id} could not get a workspace: {e}");
                return self.finish(handle, failure_update(&e.message));
            }
        };

        log::info!("Job {job_id} started: {url}");
        let progress: Arc<dyn ProgressSink> = self.recorder.clone();
        let mut artifacts = PipelineArtifacts::new(url);

        for (stage, step) in self.stages.ordered() {
            if token.is_cancelled() {
                return self.finish(handle, StatusUpdate::stage(Stage::Cancelled));
            }

            self.recorder.update(&job_id, StatusUpdate::stage(stage));
            let ctx = StageContext::new(
                job_id.clone(),
                stage,
                workspace.clone(),
                self.workspace.output_root().to_path_buf(),
                self.stage_timeout,
                handle.processes().clone(),
            )
            .with_progress(progress.clone());

            log::debug!("Job {job_id}: running {} ({stage})", step.name());
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    Err(StageError::cancelled(format!("{stage} interrupted by cancellation")))
                }
                r = tokio::time::timeout(self.stage_timeout, step.run(artifacts, &ctx)) => {
                    r.unwrap_or_else(|_| {
                        Err(StageError::timeout(format!(
                            "{} exceeded {}s",
                            step.name(),
                            self.stage_timeout.as_secs()
                        )))
                    })
                }
            };
            self.metrics
                .record_latency(stage, u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

            match result {
                Ok(next) => artifacts = next,
                Err(e) if e.is_cancelled() => {
                    log::info!("Job {job_id} cancelled during {stage}");
                    return self.finish(handle, StatusUpdate::stage(Stage::Cancelled));
                }
                Err(e) => {
                    log::error!("Job {job_id} failed during {stage}: {e}");
                    return self.finish(handle, failure_update(&e.detail));
                }
            }
        }

        log::info!("Job {job_id} completed");
        self.finish(
            handle,
            StatusUpdate::stage(Stage::Completed).extras(artifacts.result_extras()),
        )
    }

    /// 終端ステータスを書き込み、残ったプロセスグループとワークスペースを片付けてハンドルを外す。
    ///
    /// キャンセル側が先に終端処理を済ませていれば何もしない。
    pub(crate) fn finish(&self, handle: &ExecutionHandle, update: StatusUpdate) -> JobOutcome {
        let job_id = handle.job_id();
        let stage = update.stage;
        let claimed = handle.finish_with(stage, || {
            // ステージの future が途中で破棄された場合に残るプロセスグループ
            let killed = handle.processes().terminate_all();
            if killed > 0 {
                log::warn!("Job {job_id}: killed {killed} leftover process group(s)");
            }
            self.recorder.update(job_id, update);
            self.workspace.release(job_id);
            self.metrics.inc_terminal(stage);
        });
        self.registry.unregister(job_id);

        match claimed {
            Ok(()) => JobOutcome::from_stage(stage),
            Err(existing) => {
                log::debug!("Job {job_id} already finished as {existing}; dropping {stage}");
                JobOutcome::from_stage(existing)
            }
        }
    }
}

fn failure_update(detail: &str) -> StatusUpdate {
    StatusUpdate::stage(Stage::Failed)
        .message(format!("Error: {detail}"))
        .extras(StatusExtras::error(detail))
}

/// 同時実行数を制限してジョブを tokio タスクとして走らせる
pub struct WorkerPool {
    executor: Arc<WorkerExecutor>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(executor: Arc<WorkerExecutor>, max_concurrent_jobs: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    /// ジョブを投入する。空きスロットを待つ間もキャンセル可能。
    ///
    /// tokio ランタイム内から呼ぶこと。
    pub fn spawn(&self, handle: ExecutionHandle, url: String) -> JoinHandle<JobOutcome> {
        let executor = self.executor.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let token = handle.token();
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::debug!("Job {} cancelled while queued", handle.job_id());
                    return JobOutcome::Cancelled;
                }
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        log::error!("Worker pool closed before job {} could start", handle.job_id());
                        return executor.finish(&handle, failure_update("Worker pool closed"));
                    }
                },
            };

            let task = tokio::spawn({
                let executor = executor.clone();
                let handle = handle.clone();
                async move { executor.run(&handle, url).await }
            });
            handle.attach_task(task.abort_handle());

            match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
                Err(e) => {
                    log::error!("Job {} worker panicked: {e}", handle.job_id());
                    executor.finish(&handle, failure_update("Internal worker error"))
                }
            }
        })
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}
