use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::Stage;

/// 1ステージ分の計測値。`duration` は次のイベント記録時に一度だけ確定する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpan {
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration: Option<f64>,
}

/// ジョブ全体のステージ別タイミング（秒単位）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    pub start_time: DateTime<Utc>,
    pub stages: BTreeMap<Stage, StageSpan>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_duration: Option<f64>,
}

impl StageTiming {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            stages: BTreeMap::new(),
            total_duration: None,
        }
    }

    /// `stage` への遷移を `now` 時点で記録する。
    ///
    /// - 作業ステージへの初回遷移: 開いているステージを閉じ、開始時刻を記録
    /// - 同じステージの再記録: 何もしない（閉じたステージは再オープンしない）
    /// - completed: 開いているステージを閉じ、未設定なら total_duration を確定
    /// - failed / cancelled: 開いているステージを閉じるのみ
    pub fn record(&mut self, stage: Stage, now: DateTime<Utc>) {
        match stage {
            Stage::Started => {}
            Stage::Completed => {
                self.close_open(now);
                if self.total_duration.is_none() {
                    self.total_duration = Some(seconds_between(self.start_time, now));
                }
            }
            Stage::Failed | Stage::Cancelled => self.close_open(now),
            ordered => {
                if self.stages.contains_key(&ordered) {
                    return;
                }
                self.close_open(now);
                self.stages.insert(
                    ordered,
                    StageSpan {
                        start: now,
                        duration: None,
                    },
                );
            }
        }
    }

    /// まだ duration が確定していないステージ
    pub fn open_stage(&self) -> Option<Stage> {
        self.stages
            .iter()
            .find(|(_, span)| span.duration.is_none())
            .map(|(stage, _)| *stage)
    }

    /// 確定済みステージ時間の合計
    pub fn closed_duration_sum(&self) -> f64 {
        self.stages.values().filter_map(|span| span.duration).sum()
    }

    fn close_open(&mut self, now: DateTime<Utc>) {
        for span in self.stages.values_mut() {
            if span.duration.is_none() {
                span.duration = Some(seconds_between(span.start, now));
            }
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let micros = (to - from).num_microseconds().unwrap_or(i64::MAX);
    (micros as f64 / 1_000_000.0).max(0.0)
}
