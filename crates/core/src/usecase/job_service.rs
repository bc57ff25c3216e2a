use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::error::AppError;
use crate::domain::job::{CancelOutcome, JobId, JobStatus};
use crate::domain::settings::OrchestratorSettings;
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::infra::stage::StageSet;
use crate::infra::storage::{SqliteStatusStore, StatusStore};
use crate::infra::workspace::WorkspaceManager;
use crate::usecase::cancellation::CancellationController;
use crate::usecase::execution_registry::{ExecutionHandle, ExecutionRegistry};
use crate::usecase::executor::{WorkerExecutor, WorkerPool};
use crate::usecase::reaper::{self, CleanupReport};
use crate::usecase::status_recorder::StatusRecorder;

/// 動画字幕ジョブのオーケストレーションサービス（トランスポート層から呼ばれる入口）
pub struct JobService {
    settings: OrchestratorSettings,
    recorder: Arc<StatusRecorder>,
    registry: Arc<ExecutionRegistry>,
    workspace: Arc<WorkspaceManager>,
    metrics: Arc<Metrics>,
    pool: WorkerPool,
    canceller: CancellationController,
    reaper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl JobService {
    pub fn new(
        settings: OrchestratorSettings,
        store: Arc<dyn StatusStore>,
        stages: StageSet,
    ) -> Result<Self, AppError> {
        let metrics = Arc::new(Metrics::new());
        let workspace = Arc::new(WorkspaceManager::new(
            &settings.upload_dir,
            &settings.output_dir,
            settings.retention(),
            metrics.clone(),
        ));
        workspace.ensure_roots()?;

        let recorder = Arc::new(StatusRecorder::new(
            store,
            settings.retention(),
            metrics.clone(),
        ));
        let registry = Arc::new(ExecutionRegistry::new());
        let executor = Arc::new(WorkerExecutor::new(
            stages,
            recorder.clone(),
            registry.clone(),
            workspace.clone(),
            metrics.clone(),
            settings.stage_timeout(),
        ));
        let pool = WorkerPool::new(executor, settings.max_concurrent_jobs);
        let canceller = CancellationController::new(
            registry.clone(),
            recorder.clone(),
            workspace.clone(),
            metrics.clone(),
            settings.cancel_policy,
        );

        log::info!(
            "JobService ready (workers={}, retention={}h, upload={}, output={})",
            settings.max_concurrent_jobs,
            settings.retention_hours,
            settings.upload_dir.display(),
            settings.output_dir.display()
        );

        Ok(Self {
            settings,
            recorder,
            registry,
            workspace,
            metrics,
            pool,
            canceller,
            reaper: Mutex::new(None),
        })
    }

    /// `settings.db_path` の SQLite ストアを開いて構築する
    pub fn open(settings: OrchestratorSettings, stages: StageSet) -> Result<Self, AppError> {
        let store = SqliteStatusStore::open(&settings.db_path)?;
        Self::new(settings, Arc::new(store), stages)
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    // ==================== Jobs ====================

    /// ジョブを投入して即座に JobId を返す。tokio ランタイム内から呼ぶこと。
    pub fn submit_job(&self, url: &str) -> Result<JobId, AppError> {
        let url = validate_url(url)?;
        let job_id = JobId::generate();

        self.recorder.initialize(&job_id);
        let handle = ExecutionHandle::new(job_id.clone());
        self.registry.register(handle.clone());
        self.metrics.inc_jobs_submitted();

        // 完了は get_status のポーリングで観測する
        drop(self.pool.spawn(handle, url.clone()));
        log::info!("Job {job_id} submitted: {url}");
        Ok(job_id)
    }

    pub fn get_status(&self, job_id: &JobId) -> Result<JobStatus, AppError> {
        self.recorder.get(job_id)
    }

    pub fn cancel_job(&self, job_id: &JobId) -> CancelOutcome {
        CancelOutcome {
            success: self.canceller.cancel(job_id),
        }
    }

    /// 終端に達していないジョブ
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.registry.job_ids()
    }

    // ==================== Outputs ====================

    pub fn resolve_output(&self, filename: &str) -> Result<PathBuf, AppError> {
        self.workspace.resolve_output(filename)
    }

    pub fn delete_output(&self, filename: &str) -> Result<(), AppError> {
        self.workspace.delete_output(filename)
    }

    // ==================== Maintenance ====================

    /// 定期クリーンアップを開始する（二重起動しない）
    pub fn start(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let task = reaper::spawn_reaper(
            self.workspace.clone(),
            self.recorder.clone(),
            self.settings.cleanup_interval(),
            shutdown.clone(),
        );
        *reaper = Some((shutdown, task));
    }

    /// クリーンアップを止め、実行中のジョブをすべてキャンセルする
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().take();
        if let Some((shutdown, task)) = reaper {
            shutdown.cancel();
            if let Err(e) = task.await {
                log::warn!("Cleanup task ended abnormally: {e}");
            }
        }
        let cancelled = self.canceller.cancel_all();
        if cancelled > 0 {
            log::info!("Cancelled {cancelled} job(s) on shutdown");
        }
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        reaper::run_once(&self.workspace, &self.recorder).await
    }

    pub fn get_metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}

fn validate_url(url: &str) -> Result<String, AppError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AppError::validation("Please provide a video URL"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(AppError::validation(format!("Invalid video URL: {url}")));
    }
    Ok(url.to_string())
}
