//! Run metrics and diagnostic sampling
//!
//! Four counters accumulate as records complete. Every *thresh*-th record
//! the aggregator emits a diagnostic sample: current counters, the
//! record-processing timer, and the process's memory footprint against
//! system memory. Sampling is observability only; it never changes counter
//! values or control flow.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

/// Final counters embedded into the batch run at finalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub inserted: u64,
    pub updated: u64,
    pub scanned: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_ingest: Option<PostIngestMetrics>,
}

/// Contribution of the post-ingest hook, when it modified anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostIngestMetrics {
    pub updated: u64,
}

/// Accumulates wall time across start/stop cycles, one cycle per record.
#[derive(Debug, Default)]
pub struct RecordTimer {
    count: u64,
    total: Duration,
    started: Option<Instant>,
}

impl RecordTimer {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.count += 1;
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
        }
    }

    /// Number of start() calls so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Accumulates run counters and emits periodic diagnostic samples.
pub struct MetricsAggregator {
    metrics: RunMetrics,
    thresh: u64,
    timer: RecordTimer,
    system: System,
}

impl MetricsAggregator {
    pub fn new(thresh: u64) -> Self {
        Self {
            metrics: RunMetrics::default(),
            // Guard the modulo below; an interval of 1 samples every record.
            thresh: thresh.max(1),
            timer: RecordTimer::default(),
            system: System::new(),
        }
    }

    /// Mark the start of a record's processing cycle. Returns true when this
    /// record is a diagnostic sample point.
    pub fn begin_record(&mut self) -> bool {
        self.timer.start();
        self.timer.count() % self.thresh == 0
    }

    /// Mark the end of a record's processing cycle, emitting the diagnostic
    /// sample when due.
    pub fn end_record(&mut self, is_sample: bool) {
        self.timer.stop();
        if is_sample {
            self.sample();
        }
    }

    /// Fold a successful outcome into the counters.
    ///
    /// An outcome with no write counters and no explicit scan count is
    /// counted as exactly one scan.
    pub fn record_success(&mut self, outcome: &crate::processor::RecordOutcome) {
        self.metrics.inserted += outcome.upserted;
        self.metrics.updated += outcome.modified;
        self.metrics.scanned += if outcome.is_scan_only() { 1 } else { outcome.scanned };
    }

    /// Count an isolated per-record failure.
    pub fn record_failure(&mut self) {
        self.metrics.failed += 1;
    }

    /// Bulk runs: the source count is recorded as inserted wholesale.
    pub fn record_bulk_insert(&mut self, count: u64) {
        self.metrics.inserted += count;
    }

    pub fn set_post_ingest(&mut self, post_ingest: PostIngestMetrics) {
        self.metrics.post_ingest = Some(post_ingest);
    }

    pub fn current(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn into_metrics(self) -> RunMetrics {
        self.metrics
    }

    /// Emit the diagnostic sample. Observability only.
    fn sample(&mut self) {
        let (process_mb, total_mb, ratio) = self.memory_usage();
        debug!(
            inserted = self.metrics.inserted,
            updated = self.metrics.updated,
            scanned = self.metrics.scanned,
            failed = self.metrics.failed,
            records = self.timer.count(),
            total_ms = self.timer.total().as_millis() as u64,
            mean_us = self.timer.mean().as_micros() as u64,
            process_mb,
            total_mb,
            memory_pct = ratio,
            "diagnostic sample"
        );
    }

    /// Process RSS and system total, in MB, plus used/total percent.
    fn memory_usage(&mut self) -> (u64, u64, u64) {
        let pid = Pid::from_u32(std::process::id());
        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let process_mb = self
            .system
            .process(pid)
            .map(|p| p.memory() / 1_000_000)
            .unwrap_or(0);
        let total_mb = self.system.total_memory() / 1_000_000;
        let ratio = if total_mb == 0 { 0 } else { process_mb * 100 / total_mb };
        (process_mb, total_mb, ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::RecordOutcome;

    #[test]
    fn test_timer_accumulates_cycles() {
        let mut timer = RecordTimer::default();
        timer.start();
        timer.stop();
        timer.start();
        timer.stop();
        assert_eq!(timer.count(), 2);
        assert!(timer.mean() <= timer.total());
    }

    #[test]
    fn test_sample_points_every_thresh_records() {
        let mut agg = MetricsAggregator::new(3);
        let samples: Vec<bool> = (0..7)
            .map(|_| {
                let is_sample = agg.begin_record();
                agg.end_record(is_sample);
                is_sample
            })
            .collect();
        assert_eq!(samples, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_success_tally() {
        let mut agg = MetricsAggregator::new(100);
        agg.record_success(&RecordOutcome {
            upserted: 1,
            ..Default::default()
        });
        agg.record_success(&RecordOutcome {
            modified: 2,
            ..Default::default()
        });
        agg.record_success(&RecordOutcome::default()); // scan-only
        agg.record_failure();

        let metrics = agg.into_metrics();
        assert_eq!(metrics.inserted, 1);
        assert_eq!(metrics.updated, 2);
        assert_eq!(metrics.scanned, 1);
        assert_eq!(metrics.failed, 1);
    }

    #[test]
    fn test_sampling_does_not_change_counters() {
        let mut agg = MetricsAggregator::new(1);
        let is_sample = agg.begin_record();
        assert!(is_sample);
        agg.record_success(&RecordOutcome::default());
        let before = agg.current().clone();
        agg.end_record(is_sample);
        assert_eq!(agg.current(), &before);
    }
}
