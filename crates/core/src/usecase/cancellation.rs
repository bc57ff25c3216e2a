use std::sync::Arc;

use crate::domain::job::{JobId, Stage};
use crate::domain::settings::CancelPolicy;
use crate::infra::metrics::Metrics;
use crate::infra::workspace::WorkspaceManager;
use crate::usecase::execution_registry::ExecutionRegistry;
use crate::usecase::status_recorder::{StatusRecorder, StatusUpdate};

/// 実行中ジョブの強制停止
pub struct CancellationController {
    registry: Arc<ExecutionRegistry>,
    recorder: Arc<StatusRecorder>,
    workspace: Arc<WorkspaceManager>,
    metrics: Arc<Metrics>,
    policy: CancelPolicy,
}

impl CancellationController {
    pub fn new(
        registry: Arc<ExecutionRegistry>,
        recorder: Arc<StatusRecorder>,
        workspace: Arc<WorkspaceManager>,
        metrics: Arc<Metrics>,
        policy: CancelPolicy,
    ) -> Self {
        Self {
            registry,
            recorder,
            workspace,
            metrics,
            policy,
        }
    }

    /// ジョブをキャンセルする。
    ///
    /// ハンドルが無ければ何も変更せず `false`。ハンドルがあればタスクと
    /// 外部プロセスを止め、cancelled を書き込み、ワークスペースを解放する。
    /// executor が終端ステータスを書いた直後でハンドルがまだ残っていた場合は
    /// `CancelPolicy` に従う。
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let Some(handle) = self.registry.unregister(job_id) else {
            log::info!("Cancel requested for job {job_id}, but it is not running");
            return false;
        };

        let claimed = handle.finish_with(Stage::Cancelled, || {
            let killed = handle.terminate();
            self.recorder
                .update(job_id, StatusUpdate::stage(Stage::Cancelled));
            self.workspace.release(job_id);
            self.metrics.inc_terminal(Stage::Cancelled);
            killed
        });

        match claimed {
            Ok(killed) => {
                log::info!("Job {job_id} cancelled ({killed} process group(s) killed)");
                true
            }
            Err(existing) => match self.policy {
                CancelPolicy::LastWriteWins => {
                    log::info!("Job {job_id} had just reached {existing}; recording cancellation over it");
                    self.recorder
                        .update(job_id, StatusUpdate::stage(Stage::Cancelled));
                    true
                }
                CancelPolicy::RejectAfterTerminal => {
                    log::info!("Job {job_id} already {existing}; cancellation rejected");
                    false
                }
            },
        }
    }

    /// 登録中の全ジョブをキャンセルし、停止できた件数を返す
    pub fn cancel_all(&self) -> usize {
        self.registry
            .job_ids()
            .iter()
            .filter(|job_id| self.cancel(job_id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::StatusExtras;
    use crate::infra::storage::SqliteStatusStore;
    use crate::usecase::execution_registry::ExecutionHandle;
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<ExecutionRegistry>,
        recorder: Arc<StatusRecorder>,
        workspace: Arc<WorkspaceManager>,
        metrics: Arc<Metrics>,
    }

    impl Fixture {
        fn new(root: &Path) -> Self {
            let metrics = Arc::new(Metrics::new());
            let recorder = Arc::new(StatusRecorder::new(
                Arc::new(SqliteStatusStore::open_in_memory().unwrap()),
                Duration::from_secs(3600),
                metrics.clone(),
            ));
            let workspace = Arc::new(WorkspaceManager::new(
                root.join("temp_files"),
                root.join("output_files"),
                Duration::from_secs(3600),
                metrics.clone(),
            ));
            workspace.ensure_roots().unwrap();
            Self {
                registry: Arc::new(ExecutionRegistry::new()),
                recorder,
                workspace,
                metrics,
            }
        }

        fn controller(&self, policy: CancelPolicy) -> CancellationController {
            CancellationController::new(
                self.registry.clone(),
                self.recorder.clone(),
                self.workspace.clone(),
                self.metrics.clone(),
                policy,
            )
        }

        fn running_job(&self) -> ExecutionHandle {
            let handle = ExecutionHandle::new(JobId::generate());
            self.recorder.initialize(handle.job_id());
            self.recorder
                .update(handle.job_id(), StatusUpdate::stage(Stage::Downloading));
            self.workspace.allocate(handle.job_id()).unwrap();
            self.registry.register(handle.clone());
            handle
        }

        /// executor が completed を書き終えたがまだ unregister していない状態
        fn just_completed_job(&self) -> ExecutionHandle {
            let handle = self.running_job();
            handle
                .finish_with(Stage::Completed, || {
                    self.recorder.update(
                        handle.job_id(),
                        StatusUpdate::stage(Stage::Completed).extras(StatusExtras {
                            output_file: Some("x_subtitled.mp4".into()),
                            ..Default::default()
                        }),
                    );
                    self.workspace.release(handle.job_id());
                })
                .unwrap();
            handle
        }
    }

    #[test]
    fn unknown_job_is_not_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let f = Fixture::new(dir.path());
        let controller = f.controller(CancelPolicy::LastWriteWins);
        assert!(!controller.cancel(&JobId::from("nope")));
        assert_eq!(f.metrics.summary().workspace_releases, 0);
    }

    #[test]
    fn cancel_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let f = Fixture::new(dir.path());
        let controller = f.controller(CancelPolicy::LastWriteWins);
        let handle = f.running_job();
        let id = handle.job_id().clone();

        assert!(controller.cancel(&id));
        assert!(handle.is_cancelled());
        assert!(!f.registry.contains(&id));
        assert!(!f.workspace.workspace_path(&id).exists());

        let status = f.recorder.get(&id).unwrap();
        assert_eq!(status.stage, Stage::Cancelled);
        assert_eq!(status.message, "Task cancelled by user");
        assert_eq!(status.progress, 0);

        assert!(!controller.cancel(&id));
        let summary = f.metrics.summary();
        assert_eq!(summary.workspace_releases, 1);
        assert_eq!(summary.jobs_cancelled, 1);
    }

    #[test]
    fn last_write_wins_overwrites_completed() {
        let dir = tempfile::tempdir().unwrap();
        let f = Fixture::new(dir.path());
        let controller = f.controller(CancelPolicy::LastWriteWins);
        let handle = f.just_completed_job();
        let id = handle.job_id().clone();

        assert!(controller.cancel(&id));
        let status = f.recorder.get(&id).unwrap();
        assert_eq!(status.stage, Stage::Cancelled);
        assert_eq!(status.extras.output_file.as_deref(), Some("x_subtitled.mp4"));
        assert_eq!(f.metrics.summary().workspace_releases, 1);
    }

    #[test]
    fn reject_after_terminal_keeps_completed() {
        let dir = tempfile::tempdir().unwrap();
        let f = Fixture::new(dir.path());
        let controller = f.controller(CancelPolicy::RejectAfterTerminal);
        let handle = f.just_completed_job();
        let id = handle.job_id().clone();

        assert!(!controller.cancel(&id));
        assert_eq!(f.recorder.get(&id).unwrap().stage, Stage::Completed);
        assert!(!handle.is_cancelled());
        assert_eq!(f.metrics.summary().workspace_releases, 1);
    }

    #[test]
    fn cancel_all_stops_every_job() {
        let dir = tempfile::tempdir().unwrap();
        let f = Fixture::new(dir.path());
        let controller = f.controller(CancelPolicy::LastWriteWins);
        let a = f.running_job();
        let b = f.running_job();

        assert_eq!(controller.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(f.registry.is_empty());
    }
}
