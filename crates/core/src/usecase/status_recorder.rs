use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::domain::error::AppError;
use crate::domain::job::{JobId, JobStatus, Stage, StatusExtras};
use crate::infra::metrics::Metrics;
use crate::infra::stage::ProgressSink;
use crate::infra::storage::{StatusStore, StoreError};

/// 1回分のステータス更新内容
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub stage: Stage,
    pub message: String,
    pub progress: u8,
    pub extras: StatusExtras,
}

impl StatusUpdate {
    /// ステージ既定のメッセージとチェックポイント値で作る
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage,
            message: stage.default_message().to_string(),
            progress: stage.checkpoint(),
            extras: StatusExtras::default(),
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn extras(mut self, extras: StatusExtras) -> Self {
        self.extras = extras;
        self
    }
}

/// プロセス内に保持する最後の書き込み結果
#[derive(Debug, Clone)]
struct CachedStatus {
    status: JobStatus,
    expires_at: DateTime<Utc>,
    /// 永続ストアへの書き込みが成功したか
    durable: bool,
}

impl CachedStatus {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// ジョブステータスの唯一の書き込み口。
///
/// 書き込みは永続ストアと、ジョブごとの直近スナップショット（write-through キャッシュ）の
/// 両方に行う。ストアが読めないときはキャッシュから答える。
/// 同じジョブへの read-modify-write は DashMap のエントリロックで直列化される。
pub struct StatusRecorder {
    store: Arc<dyn StatusStore>,
    cache: DashMap<JobId, Option<CachedStatus>>,
    retention: chrono::Duration,
    metrics: Arc<Metrics>,
}

impl StatusRecorder {
    pub fn new(
        store: Arc<dyn StatusStore>,
        retention: std::time::Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            store,
            cache: DashMap::new(),
            retention,
            metrics,
        }
    }

    /// 投入直後の started / 0% を書き込む
    pub fn initialize(&self, job_id: &JobId) -> JobStatus {
        let now = Utc::now();
        let mut slot = self.cache.entry(job_id.clone()).or_default();
        let status = JobStatus::initial(now);
        *slot = Some(self.write(job_id, &status, now));
        status
    }

    pub fn update(&self, job_id: &JobId, update: StatusUpdate) -> Option<JobStatus> {
        self.update_at(job_id, update, Utc::now())
    }

    /// `now` 時点の更新としてスナップショットを書き換える。
    ///
    /// 終端ステータスの後に届いた非終端の更新は無視して `None` を返す。
    /// 終端同士は後勝ち。
    pub fn update_at(
        &self,
        job_id: &JobId,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Option<JobStatus> {
        let mut slot = self.cache.entry(job_id.clone()).or_default();

        let mut status = match self.read(job_id, slot.value().as_ref(), now) {
            Ok(Some(status)) => status,
            Ok(None) => {
                log::debug!("No prior status for job {job_id}; starting a new record");
                JobStatus::initial(now)
            }
            Err(e) => {
                log::warn!("No readable status for job {job_id}, starting a new record: {e}");
                JobStatus::initial(now)
            }
        };

        if status.is_terminal() && !update.stage.is_terminal() {
            log::debug!(
                "Ignoring {} update for job {job_id}: already {}",
                update.stage,
                status.stage
            );
            return None;
        }
        if status.stage != update.stage && !status.stage.can_transition_to(update.stage) {
            log::warn!(
                "Unexpected transition for job {job_id}: {} -> {}",
                status.stage,
                update.stage
            );
        }

        status.timing.record(update.stage, now);
        status.stage = update.stage;
        status.message = update.message;
        status.progress = update.progress.min(100);
        status.updated_at = now;
        status.extras.merge(update.extras);

        *slot = Some(self.write(job_id, &status, now));
        log::debug!("Job {job_id} -> {} ({}%)", status.stage, status.progress);
        Some(status)
    }

    /// 最後に書き込まれたスナップショットを返す
    pub fn get(&self, job_id: &JobId) -> Result<JobStatus, AppError> {
        let now = Utc::now();
        let cached = self
            .cache
            .get(job_id)
            .and_then(|slot| slot.value().clone());
        match self.read(job_id, cached.as_ref(), now) {
            Ok(Some(status)) => Ok(status),
            Ok(None) => Err(AppError::not_found(format!("Job not found: {job_id}"))),
            Err(e) => {
                log::warn!("Status store unreadable for unknown job {job_id}: {e}");
                Err(AppError::not_found(format!("Job not found: {job_id}")))
            }
        }
    }

    /// 保持期限切れのステータスを削除する（ストア + キャッシュ）。
    ///
    /// キャッシュ側は永続化されていなかったものだけを件数に含める。
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut from_cache = 0;
        self.cache.retain(|_, slot| match slot {
            Some(cached) if cached.live(now) => true,
            Some(cached) => {
                if !cached.durable {
                    from_cache += 1;
                }
                false
            }
            None => false,
        });
        let from_store = match self.store.purge_expired(now) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Failed to purge expired statuses: {e}");
                0
            }
        };
        from_cache + from_store
    }

    /// ストアに書けずメモリにだけあるジョブ数
    pub fn fallback_len(&self) -> usize {
        self.cache
            .iter()
            .filter(|entry| matches!(entry.value(), Some(cached) if !cached.durable))
            .count()
    }

    /// `Ok(None)` は記録なし、`Err` はストアが読めずキャッシュも無い場合
    fn read(
        &self,
        job_id: &JobId,
        cached: Option<&CachedStatus>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobStatus>, StoreError> {
        let cached = cached.filter(|c| c.live(now));
        if let Some(c) = cached.filter(|c| !c.durable) {
            return Ok(Some(c.status.clone()));
        }
        match self.store.get(job_id, now) {
            Ok(found) => Ok(found),
            Err(e) => match cached {
                Some(c) => {
                    log::warn!("Status store read failed for job {job_id}, serving cached copy: {e}");
                    Ok(Some(c.status.clone()))
                }
                None => Err(e),
            },
        }
    }

    fn write(&self, job_id: &JobId, status: &JobStatus, now: DateTime<Utc>) -> CachedStatus {
        let expires_at = now
            .checked_add_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let durable = match self.store.put(job_id, status, expires_at) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Status store unavailable, keeping job {job_id} in memory: {e}");
                self.metrics.inc_store_fallbacks();
                false
            }
        };
        CachedStatus {
            status: status.clone(),
            expires_at,
            durable,
        }
    }
}

impl ProgressSink for StatusRecorder {
    /// 現在のステージが `stage` のままならメッセージだけ差し替える
    fn report(&self, job_id: &JobId, stage: Stage, message: &str) {
        let now = Utc::now();
        let Some(mut slot) = self.cache.get_mut(job_id) else {
            return;
        };
        let Ok(Some(mut status)) = self.read(job_id, slot.value().as_ref(), now) else {
            return;
        };
        if status.stage != stage {
            return;
        }
        status.message = message.to_string();
        status.updated_at = now;
        *slot = Some(self.write(job_id, &status, now));
    }
}
