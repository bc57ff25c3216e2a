use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::infra::workspace::{SweepReport, WorkspaceManager};
use crate::usecase::status_recorder::StatusRecorder;

/// 定期クリーンアップ1回分の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub files_removed: u32,
    pub dirs_removed: u32,
    pub statuses_purged: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.files_removed == 0 && self.dirs_removed == 0 && self.statuses_purged == 0
    }
}

/// 保持期限切れの出力・作業ディレクトリ・ステータスを1回掃除する
pub async fn run_once(workspace: &Arc<WorkspaceManager>, recorder: &StatusRecorder) -> CleanupReport {
    let ws = workspace.clone();
    let sweep = match tokio::task::spawn_blocking(move || ws.sweep(SystemTime::now())).await {
        Ok(report) => report,
        Err(e) => {
            log::error!("Error in cleanup task: {e}");
            SweepReport::default()
        }
    };
    let statuses_purged = recorder.purge_expired(Utc::now());

    CleanupReport {
        files_removed: sweep.files_removed,
        dirs_removed: sweep.dirs_removed,
        statuses_purged,
    }
}

/// `interval` ごとに `run_once` を回すタスクを起動する。`shutdown` で停止。
pub fn spawn_reaper(
    workspace: Arc<WorkspaceManager>,
    recorder: Arc<StatusRecorder>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Cleanup task started (every {}s)", interval.as_secs());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = run_once(&workspace, &recorder).await;
                    if report.is_empty() {
                        log::debug!("Cleanup task: nothing to remove");
                    } else {
                        log::info!(
                            "Cleanup task removed {} file(s), {} dir(s), {} status record(s)",
                            report.files_removed,
                            report.dirs_removed,
                            report.statuses_purged
                        );
                    }
                }
            }
        }
        log::info!("Cleanup task stopped");
    })
}
