use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{StatusStore, StoreError};
use crate::domain::job::{JobId, JobStatus};

/// SQLite ステータスストア（job_status テーブル、expires_at で TTL を表現）
pub struct SqliteStatusStore {
    conn: Mutex<Connection>,
}

impl SqliteStatusStore {
    /// 新規接続（ファイルパス指定）
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// スキーママイグレーション
    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS job_status (
                job_id     TEXT PRIMARY KEY,
                payload    TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_status_expires
                ON job_status(expires_at);
            ",
        )?;
        Ok(())
    }
}

impl StatusStore for SqliteStatusStore {
    fn put(
        &self,
        job_id: &JobId,
        status: &JobStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(status)?;
        self.conn.lock().execute(
            "INSERT INTO job_status (job_id, payload, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
            params![
                job_id.as_str(),
                payload,
                status.updated_at.timestamp_millis(),
                expires_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn get(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<Option<JobStatus>, StoreError> {
        let payload: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT payload FROM job_status WHERE job_id = ?1 AND expires_at > ?2",
                params![job_id.as_str(), now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM job_status WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}
