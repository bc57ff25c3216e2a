use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// オーケストレータ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// ジョブごとの作業ディレクトリを置く親ディレクトリ
    pub upload_dir: PathBuf,
    /// 字幕焼き込み済み動画の出力先
    pub output_dir: PathBuf,
    /// ステータス DB（SQLite）のパス
    pub db_path: PathBuf,
    /// 出力ファイルとステータスの保持時間
    pub retention_hours: u64,
    /// 定期クリーンアップの間隔（秒）
    pub cleanup_interval_secs: u64,
    /// 同時に実行するジョブ数
    pub max_concurrent_jobs: usize,
    /// 1ステージあたりのタイムアウト（秒）
    pub stage_timeout_secs: u64,
    /// 終端後に届いたキャンセルの扱い
    pub cancel_policy: CancelPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// 終端ステータス書き込み後でもハンドルが残っていれば cancelled で上書きする
    LastWriteWins,
    /// 終端ステータスが見えた時点でキャンセルを拒否する
    RejectAfterTerminal,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            upload_dir: base.join("temp_files"),
            output_dir: base.join("output_files"),
            db_path: base.join("status.db"),
            retention_hours: 24,
            cleanup_interval_secs: 3600,
            max_concurrent_jobs: 2,
            stage_timeout_secs: 1800,
            cancel_policy: CancelPolicy::LastWriteWins,
        }
    }
}

impl OrchestratorSettings {
    /// デフォルト値に環境変数を重ねる
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("UPLOAD_FOLDER") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("OUTPUT_FOLDER") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("VS_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(v) = parse_var(&lookup, "FILE_RETENTION_HOURS") {
            self.retention_hours = v;
        }
        if let Some(v) = parse_var(&lookup, "VS_CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval_secs = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "VS_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = v.max(1);
        }
        if let Some(v) = parse_var(&lookup, "VS_STAGE_TIMEOUT_SECS") {
            self.stage_timeout_secs = v;
        }
        if let Some(policy) = lookup("VS_CANCEL_POLICY") {
            match policy.as_str() {
                "last_write_wins" => self.cancel_policy = CancelPolicy::LastWriteWins,
                "reject_after_terminal" => self.cancel_policy = CancelPolicy::RejectAfterTerminal,
                other => log::warn!("Ignoring unknown VS_CANCEL_POLICY value: {other}"),
            }
        }
        self
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring invalid value for {key}: {raw:?}");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("video-subtitler")
}
