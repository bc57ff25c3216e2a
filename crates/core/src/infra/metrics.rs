use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::job::Stage;

const MAX_LATENCY_RECORDS: usize = 1000;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    jobs_submitted: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_cancelled: u64,
    workspace_releases: u64,
    store_fallbacks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub stage: Stage,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub workspace_releases: u64,
    pub store_fallbacks: u64,
    pub avg_latency_ms: AvgLatency,
    pub recent_latencies: Vec<LatencyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvgLatency {
    pub downloading: Option<f64>,
    pub transcribing: Option<f64>,
    pub translating: Option<f64>,
    pub generating_subtitles: Option<f64>,
    pub burning_subtitles: Option<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_jobs_submitted(&self) {
        self.counters.lock().jobs_submitted += 1;
    }

    /// 終端ステージごとのカウンタを進める
    pub fn inc_terminal(&self, stage: Stage) {
        let mut c = self.counters.lock();
        match stage {
            Stage::Completed => c.jobs_completed += 1,
            Stage::Failed => c.jobs_failed += 1,
            Stage::Cancelled => c.jobs_cancelled += 1,
            other => log::debug!("inc_terminal called with non-terminal stage {other}"),
        }
    }

    pub fn inc_workspace_releases(&self) {
        self.counters.lock().workspace_releases += 1;
    }

    pub fn inc_store_fallbacks(&self) {
        self.counters.lock().store_fallbacks += 1;
    }

    pub fn record_latency(&self, stage: Stage, duration_ms: u64) {
        let record = LatencyRecord {
            stage,
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push(record);
        // 最新1000件のみ保持
        if latencies.len() > MAX_LATENCY_RECORDS {
            let excess = latencies.len() - MAX_LATENCY_RECORDS;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let avg = |stage: Stage| -> Option<f64> {
            let vals: Vec<f64> = latencies
                .iter()
                .filter(|r| r.stage == stage)
                .map(|r| r.duration_ms as f64)
                .collect();
            if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<f64>() / vals.len() as f64)
            }
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            jobs_submitted: c.jobs_submitted,
            jobs_completed: c.jobs_completed,
            jobs_failed: c.jobs_failed,
            jobs_cancelled: c.jobs_cancelled,
            workspace_releases: c.workspace_releases,
            store_fallbacks: c.store_fallbacks,
            avg_latency_ms: AvgLatency {
                downloading: avg(Stage::Downloading),
                transcribing: avg(Stage::Transcribing),
                translating: avg(Stage::Translating),
                generating_subtitles: avg(Stage::GeneratingSubtitles),
                burning_subtitles: avg(Stage::BurningSubtitles),
            },
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
