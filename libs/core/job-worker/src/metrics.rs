//! Metrics for the job worker
//!
//! Recorded through the `metrics` facade; the hosting service decides which
//! recorder (if any) is installed.

use metrics::{counter, histogram};
use std::time::Duration;

/// Job worker metrics helper
#[derive(Debug, Clone)]
pub struct JobMetrics {
    /// Queue name for labeling
    queue: String,
}

impl JobMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a delivery being received
    pub fn job_received(&self) {
        counter!(
            "job_worker_jobs_received_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a handler invocation that succeeded
    pub fn job_succeeded(&self, job_type: &str, duration: Duration) {
        self.job_processed(job_type, "success", duration);
    }

    /// Record a handler invocation that failed
    pub fn job_failed(&self, job_type: &str, duration: Duration) {
        self.job_processed(job_type, "failed", duration);
    }

    fn job_processed(&self, job_type: &str, status: &'static str, duration: Duration) {
        counter!(
            "job_worker_jobs_processed_total",
            "queue" => self.queue.clone(),
            "job_type" => job_type.to_string(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "job_worker_job_duration_seconds",
            "queue" => self.queue.clone(),
            "job_type" => job_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a retry being scheduled
    pub fn job_retried(&self, job_type: &str) {
        counter!(
            "job_worker_jobs_retried_total",
            "queue" => self.queue.clone(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    /// Record a job whose retry budget is spent
    pub fn job_abandoned(&self, job_type: &str) {
        counter!(
            "job_worker_jobs_abandoned_total",
            "queue" => self.queue.clone(),
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    /// Record a delivery acknowledged without running a handler
    pub fn job_dropped(&self, reason: &'static str) {
        counter!(
            "job_worker_jobs_dropped_total",
            "queue" => self.queue.clone(),
            "reason" => reason
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = JobMetrics::new("jobs");
        assert_eq!(metrics.queue, "jobs");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = JobMetrics::new("jobs");
        metrics.job_received();
        metrics.job_succeeded("email.send", Duration::from_millis(5));
        metrics.job_failed("email.send", Duration::from_millis(5));
        metrics.job_retried("email.send");
        metrics.job_abandoned("email.send");
        metrics.job_dropped("unroutable");
    }
}
