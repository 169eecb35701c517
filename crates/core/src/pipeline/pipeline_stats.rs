use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters shared by every stage of a running pipeline.
///
/// Capture, dispatch and result threads all record into the same instance,
/// so every counter is atomic. Dropped frames are not errors; they only show
/// up here.
#[derive(Debug)]
pub struct PipelineStats {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    capture_failures: AtomicU64,
    completed: AtomicU64,
    no_face: AtomicU64,
    errors: AtomicU64,
    abandoned: AtomicU64,
    late_discarded: AtomicU64,
    delivered: AtomicU64,
    delivery_dropped: AtomicU64,
    latency_total_us: AtomicU64,
    latency_max_us: AtomicU64,
    started: Mutex<Instant>,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub capture_failures: u64,
    pub completed: u64,
    pub no_face: u64,
    pub errors: u64,
    pub abandoned: u64,
    pub late_discarded: u64,
    pub delivered: u64,
    pub delivery_dropped: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            no_face: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            late_discarded: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            delivery_dropped: AtomicU64::new(0),
            latency_total_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
        }
    }

    pub fn frame_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capture_failed(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatched frame came back from the engine.
    pub fn detection_completed(&self, latency: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let us = latency.as_micros() as u64;
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn no_face(&self) {
        self.no_face.fetch_add(1, Ordering::Relaxed);
    }

    pub fn detection_failed(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_result_discarded(&self) {
        self.late_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_dropped(&self) {
        self.delivery_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Restarts the wall clock used for throughput.
    pub fn mark_started(&self) {
        if let Ok(mut started) = self.started.lock() {
            *started = Instant::now();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let total_us = self.latency_total_us.load(Ordering::Relaxed);
        let avg_latency_ms = if completed == 0 {
            0.0
        } else {
            total_us as f64 / completed as f64 / 1000.0
        };
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            completed,
            no_face: self.no_face.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            late_discarded: self.late_discarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_dropped: self.delivery_dropped.load(Ordering::Relaxed),
            avg_latency_ms,
            max_latency_ms: self.latency_max_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    /// Returns the formatted summary string, or `None` if nothing was submitted.
    pub fn summary_string(&self) -> Option<String> {
        let s = self.snapshot();
        if s.submitted == 0 {
            return None;
        }

        let elapsed = self
            .started
            .lock()
            .map(|started| started.elapsed())
            .unwrap_or_default()
            .as_secs_f64();

        let mut lines = vec![format!(
            "Pipeline summary ({} frames, {elapsed:.1}s total):",
            s.submitted
        )];
        lines.push(format!(
            "  frames    : {} dispatched, {} dropped, {} capture failures",
            s.dispatched, s.dropped, s.capture_failures
        ));
        lines.push(format!(
            "  results   : {} completed, {} no face, {} errors, {} abandoned, {} late",
            s.completed, s.no_face, s.errors, s.abandoned, s.late_discarded
        ));
        lines.push(format!(
            "  delivery  : {} delivered, {} dropped",
            s.delivered, s.delivery_dropped
        ));
        if s.completed > 0 {
            lines.push(format!(
                "  inference : avg {:6.1}ms  max {:6.1}ms",
                s.avg_latency_ms, s.max_latency_ms
            ));
        }
        if elapsed > 0.0 {
            let fps = s.completed as f64 / elapsed;
            lines.push(format!("  Throughput: {fps:.1} fps"));
        }

        Some(lines.join("\n"))
    }

    pub fn log_summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_counters_accumulate() {
        let stats = PipelineStats::new();
        stats.frame_submitted();
        stats.frame_submitted();
        stats.frame_dispatched();
        stats.frame_dropped();

        let s = stats.snapshot();
        assert_eq!(s.submitted, 2);
        assert_eq!(s.dispatched, 1);
        assert_eq!(s.dropped, 1);
    }

    #[test]
    fn test_latency_average_and_max() {
        let stats = PipelineStats::new();
        stats.detection_completed(Duration::from_millis(10));
        stats.detection_completed(Duration::from_millis(30));

        let s = stats.snapshot();
        assert_eq!(s.completed, 2);
        assert_relative_eq!(s.avg_latency_ms, 20.0);
        assert_relative_eq!(s.max_latency_ms, 30.0);
    }

    #[test]
    fn test_summary_mentions_each_section() {
        let stats = PipelineStats::new();
        stats.frame_submitted();
        stats.frame_dispatched();
        stats.detection_completed(Duration::from_millis(12));
        stats.update_delivered();

        let summary = stats.summary_string().unwrap();
        assert!(summary.contains("Pipeline summary"));
        assert!(summary.contains("1 dispatched"));
        assert!(summary.contains("1 delivered"));
        assert!(summary.contains("inference"));
    }

    #[test]
    fn test_empty_summary_returns_none() {
        assert!(PipelineStats::new().summary_string().is_none());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(PipelineStats::new().snapshot()).unwrap();
        assert_eq!(json["lateDiscarded"], 0);
        assert_eq!(json["deliveryDropped"], 0);
    }
}
