mod repository;

pub use repository::SqliteStatusStore;

use chrono::{DateTime, Utc};

use crate::domain::error::AppError;
use crate::domain::job::{JobId, JobStatus};

/// ステータスストアのエラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::storage(e.to_string())
    }
}

/// TTL 付きの永続ステータスストア。
///
/// `put` は1ジョブ分のスナップショット全体を原子的に置き換える。
/// 期限切れのレコードは `get` から見えない。
pub trait StatusStore: Send + Sync {
    fn put(
        &self,
        job_id: &JobId,
        status: &JobStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn get(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<Option<JobStatus>, StoreError>;

    /// 期限切れレコードを削除し、削除件数を返す
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}
