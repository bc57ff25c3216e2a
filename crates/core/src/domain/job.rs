use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timing::StageTiming;

/// ジョブ識別子（UUID v4 文字列）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// パイプラインのステージ。宣言順がそのまま実行順になる。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Started,
    Downloading,
    Transcribing,
    Translating,
    GeneratingSubtitles,
    BurningSubtitles,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    /// 外部ステージ関数に対応する作業ステージ（実行順）
    pub const ORDERED: [Stage; 5] = [
        Stage::Downloading,
        Stage::Transcribing,
        Stage::Translating,
        Stage::GeneratingSubtitles,
        Stage::BurningSubtitles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Downloading => "downloading",
            Self::Transcribing => "transcribing",
            Self::Translating => "translating",
            Self::GeneratingSubtitles => "generating_subtitles",
            Self::BurningSubtitles => "burning_subtitles",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_ordered(&self) -> bool {
        Self::ORDERED.contains(self)
    }

    /// チェックポイント表。呼び出し側に見せる進捗率はこれが正。
    /// failed / cancelled は到達点に関係なく 0 を報告する。
    pub fn checkpoint(&self) -> u8 {
        match self {
            Self::Started => 0,
            Self::Downloading => 20,
            Self::Transcribing => 40,
            Self::Translating => 60,
            Self::GeneratingSubtitles => 80,
            Self::BurningSubtitles => 90,
            Self::Completed => 100,
            Self::Failed | Self::Cancelled => 0,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Started => "Ready to process request",
            Self::Downloading => "Step 1/5: Downloading video...",
            Self::Transcribing => "Step 2/5: Transcribing audio...",
            Self::Translating => "Step 3/5: Translating...",
            Self::GeneratingSubtitles => "Step 4/5: Generating subtitle file...",
            Self::BurningSubtitles => "Step 5/5: Burning subtitles...",
            Self::Completed => "Processing completed successfully",
            Self::Failed => "Processing failed",
            Self::Cancelled => "Task cancelled by user",
        }
    }

    /// `self` から `next` への遷移が状態機械上許されるか
    pub fn can_transition_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            Self::Started => false,
            _ => (next as u8) == (*self as u8) + 1,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ステータスに付随する結果フィールド
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusExtras {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusExtras {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// `newer` の値がある項目だけ上書きする
    pub fn merge(&mut self, newer: StatusExtras) {
        if newer.output_file.is_some() {
            self.output_file = newer.output_file;
        }
        if newer.detected_language.is_some() {
            self.detected_language = newer.detected_language;
        }
        if newer.segments_count.is_some() {
            self.segments_count = newer.segments_count;
        }
        if newer.error.is_some() {
            self.error = newer.error;
        }
    }
}

/// ポーリングで返されるジョブステータスのスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub stage: Stage,
    pub message: String,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
    pub timing: StageTiming,
    #[serde(flatten)]
    pub extras: StatusExtras,
}

impl JobStatus {
    /// 投入直後のステータス（started / 0%）
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            stage: Stage::Started,
            message: Stage::Started.default_message().to_string(),
            progress: 0,
            updated_at: now,
            timing: StageTiming::new(now),
            extras: StatusExtras::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// cancel_job の戻り値
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_follow_pipeline_order() {
        let progress: Vec<u8> = std::iter::once(Stage::Started)
            .chain(Stage::ORDERED)
            .chain(std::iter::once(Stage::Completed))
            .map(|s| s.checkpoint())
            .collect();
        assert_eq!(progress, vec![0, 20, 40, 60, 80, 90, 100]);
    }

    #[test]
    fn transitions_are_strictly_sequential() {
        assert!(Stage::Started.can_transition_to(Stage::Downloading));
        assert!(Stage::Translating.can_transition_to(Stage::GeneratingSubtitles));
        assert!(Stage::BurningSubtitles.can_transition_to(Stage::Completed));
        assert!(!Stage::Downloading.can_transition_to(Stage::Translating));
        assert!(!Stage::Translating.can_transition_to(Stage::Transcribing));
        assert!(!Stage::Started.can_transition_to(Stage::Completed));
    }

    #[test]
    fn failure_and_cancel_reachable_from_any_live_stage() {
        for stage in std::iter::once(Stage::Started).chain(Stage::ORDERED) {
            assert!(stage.can_transition_to(Stage::Failed));
            assert!(stage.can_transition_to(Stage::Cancelled));
        }
    }

    #[test]
    fn terminal_stages_are_final() {
        for stage in [Stage::Completed, Stage::Failed, Stage::Cancelled] {
            assert!(stage.is_terminal());
            assert!(!stage.can_transition_to(Stage::Cancelled));
            assert!(!stage.can_transition_to(Stage::Failed));
        }
    }

    #[test]
    fn merge_keeps_existing_results() {
        let mut extras = StatusExtras {
            output_file: Some("out.mp4".into()),
            detected_language: Some("en".into()),
            segments_count: Some(12),
            error: None,
        };
        extras.merge(StatusExtras::error("boom"));
        assert_eq!(extras.output_file.as_deref(), Some("out.mp4"));
        assert_eq!(extras.segments_count, Some(12));
        assert_eq!(extras.error.as_deref(), Some("boom"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
