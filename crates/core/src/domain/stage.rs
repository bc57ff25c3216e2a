use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::job::StatusExtras;

// ─── Artifacts ───────────────────────────────────────────────────

/// 字幕1行分（秒単位のタイムコード付き）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// ステージ間で受け渡される成果物。
///
/// 各ステージは前段までの成果物を受け取り、自分の担当フィールドを埋めて返す。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineArtifacts {
    /// 投入された動画URL
    pub source_url: String,
    /// ダウンロード済み動画 (download)
    pub video_path: Option<PathBuf>,
    /// 抽出した音声 (transcribe)
    pub audio_path: Option<PathBuf>,
    /// 書き起こしセグメント (transcribe)
    pub segments: Vec<SubtitleSegment>,
    /// 検出言語 (transcribe)
    pub detected_language: Option<String>,
    /// 翻訳済みセグメント (translate)
    pub translated_segments: Vec<SubtitleSegment>,
    /// 字幕ファイル (generate_subtitles)
    pub subtitle_path: Option<PathBuf>,
    /// 字幕焼き込み済み動画 (burn_subtitles)
    pub output_path: Option<PathBuf>,
}

impl PipelineArtifacts {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    /// completed ステータスに載せる結果フィールド
    pub fn result_extras(&self) -> StatusExtras {
        let output_file = self
            .output_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|name| name.to_string_lossy().into_owned());
        StatusExtras {
            output_file,
            detected_language: self.detected_language.clone(),
            segments_count: Some(u32::try_from(self.segments.len()).unwrap_or(u32::MAX)),
            error: None,
        }
    }
}

// ─── StageError ──────────────────────────────────────────────────

/// ステージ関数の失敗。ジョブは failed で終端し、自動リトライはしない。
#[derive(Debug, Clone)]
pub struct StageError {
    /// エラー種別
    pub kind: StageErrorKind,
    /// 人間が読める詳細メッセージ
    pub detail: String,
    /// 再投入で回復しうるか
    pub recoverable: bool,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StageError::{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for StageError {}

/// ステージエラー種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// ダウンロード・API 呼び出しなどの通信失敗
    Network,
    /// 外部ツールの起動失敗・非ゼロ終了
    ExternalTool,
    /// 呼び出し側が与えたタイムアウト超過
    Timeout,
    /// 実行中にキャンセルされた
    Cancelled,
    /// 前段の成果物が欠けている
    InvalidInput,
    /// その他の内部エラー
    Internal,
}

impl StageError {
    fn new(kind: StageErrorKind, detail: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind,
            detail: detail.into(),
            recoverable,
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Network, detail, true)
    }

    pub fn external_tool(detail: impl Into<String>) -> Self {
        Self::new(StageErrorKind::ExternalTool, detail, false)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Timeout, detail, true)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Cancelled, detail, false)
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::new(StageErrorKind::InvalidInput, detail, false)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Internal, detail, false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == StageErrorKind::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_extras_use_output_basename() {
        let artifacts = PipelineArtifacts {
            output_path: Some(PathBuf::from("/srv/output/abc_subtitled.mp4")),
            detected_language: Some("en".into()),
            segments: vec![
                SubtitleSegment {
                    start: 0.0,
                    end: 1.5,
                    text: "hello".into(),
                },
                SubtitleSegment {
                    start: 1.5,
                    end: 3.0,
                    text: "world".into(),
                },
            ],
            ..PipelineArtifacts::new("https://example.com/v")
        };

        let extras = artifacts.result_extras();
        assert_eq!(extras.output_file.as_deref(), Some("abc_subtitled.mp4"));
        assert_eq!(extras.detected_language.as_deref(), Some("en"));
        assert_eq!(extras.segments_count, Some(2));
        assert!(extras.error.is_none());
    }

    #[test]
    fn result_extras_without_output() {
        let extras = PipelineArtifacts::new("https://example.com/v").result_extras();
        assert!(extras.output_file.is_none());
        assert_eq!(extras.segments_count, Some(0));
    }

    #[test]
    fn error_display_includes_kind() {
        let err = StageError::timeout("ffmpeg exceeded 30s");
        assert_eq!(err.to_string(), "StageError::Timeout: ffmpeg exceeded 30s");
        assert!(err.recoverable);
        assert!(!StageError::external_tool("exit 1").recoverable);
    }
}
