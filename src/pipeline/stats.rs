//! Per-stage timing of a `SubbandProc`.
//!
//! Each stage keeps the durations of the most recent blocks only, so a long
//! observation has a bounded footprint and the report tracks current load.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Durations of one stage over a rolling window of blocks.
#[derive(Clone, Debug)]
pub struct StageWindow {
    stage: &'static str,
    durations: VecDeque<(u64, Duration)>,
    capacity: usize,
}

impl StageWindow {
    pub fn new(stage: &'static str, capacity: usize) -> Self {
        Self {
            stage,
            durations: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn record(&mut self, block: u64, elapsed: Duration) {
        if self.durations.len() == self.capacity {
            self.durations.pop_front();
        }
        self.durations.push_back((block, elapsed));
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Oldest block still in the window.
    pub fn first_block(&self) -> Option<u64> {
        self.durations.front().map(|&(block, _)| block)
    }

    /// Mean, nearest-rank p99 and max of the window, in milliseconds.
    pub fn summary(&self) -> StageSummary {
        let mut ms: Vec<f64> = self
            .durations
            .iter()
            .map(|(_, d)| d.as_secs_f64() * 1e3)
            .collect();
        ms.sort_by(f64::total_cmp);

        let (mean_ms, p99_ms, max_ms) = match ms.last() {
            None => (0.0, 0.0, 0.0),
            Some(&max) => {
                let rank = (ms.len() as f64 * 0.99).ceil() as usize;
                let mean = ms.iter().sum::<f64>() / ms.len() as f64;
                (mean, ms[rank.saturating_sub(1)], max)
            }
        };
        StageSummary {
            stage: self.stage,
            blocks: ms.len(),
            mean_ms,
            p99_ms,
            max_ms,
        }
    }
}

/// Counters and stage windows of one `SubbandProc`.
#[derive(Clone, Debug)]
pub struct ProcStats {
    pub blocks: u64,
    pub delay_uploads: u64,

    /// Failed blocks recovered with `SubbandProc::reset`.
    pub resets: u64,

    /// Uploading through ReadingBack: everything submitted to the queue.
    pub submit: StageWindow,

    /// Host post-processing done while the queue drains.
    pub cpu_overlap: StageWindow,

    /// Blocked in `synchronize`, plus landing the read-backs.
    pub synchronize: StageWindow,

    /// Whole `process_subband` call.
    pub block_latency: StageWindow,
}

impl ProcStats {
    pub fn new(window: usize) -> Self {
        Self {
            blocks: 0,
            delay_uploads: 0,
            resets: 0,
            submit: StageWindow::new("submit", window),
            cpu_overlap: StageWindow::new("cpu_overlap", window),
            synchronize: StageWindow::new("synchronize", window),
            block_latency: StageWindow::new("block", window),
        }
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            blocks: self.blocks,
            delay_uploads: self.delay_uploads,
            resets: self.resets,
            stages: [
                &self.submit,
                &self.cpu_overlap,
                &self.synchronize,
                &self.block_latency,
            ]
            .iter()
            .map(|w| w.summary())
            .collect(),
        }
    }
}

impl Default for ProcStats {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: &'static str,
    pub blocks: usize,
    pub mean_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Snapshot for logging or JSON output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsReport {
    pub blocks: u64,
    pub delay_uploads: u64,
    pub resets: u64,
    pub stages: Vec<StageSummary>,
}

impl StatsReport {
    pub fn stage(&self, stage: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_window_keeps_latest_blocks() {
        let mut w = StageWindow::new("submit", 3);
        for block in 0..5 {
            w.record(block, ms(block));
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.first_block(), Some(2));
        let s = w.summary();
        assert_eq!(s.blocks, 3);
        assert!((s.mean_ms - 3.0).abs() < 1e-9); // [2, 3, 4]
        assert!((s.max_ms - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_p99_is_nearest_rank() {
        let mut w = StageWindow::new("synchronize", 1000);
        for block in 0..99 {
            w.record(block, ms(1));
        }
        w.record(99, ms(40));
        // rank 99 of 100 still sits in the bulk
        assert!((w.summary().p99_ms - 1.0).abs() < 1e-9);

        w.record(100, ms(40));
        assert!((w.summary().p99_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_reports_zero() {
        let s = StageWindow::new("block", 10).summary();
        assert_eq!((s.blocks, s.mean_ms, s.p99_ms, s.max_ms), (0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_report_lists_every_stage() {
        let mut stats = ProcStats::new(10);
        stats.blocks = 3;
        stats.resets = 1;
        stats.cpu_overlap.record(0, ms(4));
        let report = stats.report();
        let names: Vec<_> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(names, vec!["submit", "cpu_overlap", "synchronize", "block"]);
        assert_eq!(report.stage("cpu_overlap").map(|s| s.blocks), Some(1));

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"blocks\":3"));
        assert!(json.contains("\"resets\":1"));
        assert!(json.contains("\"stage\":\"synchronize\""));
    }
}
