use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Per-orchestrator counters. Latencies go to the global `metrics` recorder.
#[derive(Default)]
pub struct Metrics {
    model_requests: AtomicU64,
    model_failures: AtomicU64,
    model_retries: AtomicU64,
    tool_executions: AtomicU64,
    tool_failures: AtomicU64,
    compactions: AtomicU64,
    approval_denials: AtomicU64,
    confirmations: AtomicU64,
    loop_warnings: AtomicU64,
    hook_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_model_requests(&self) {
        self.model_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_model_failures(&self) {
        self.model_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_model_retries(&self) {
        self.model_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_executions(&self) {
        self.tool_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tool_failures(&self) {
        self.tool_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_compactions(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("compaction_count", 1);
    }

    pub fn inc_approval_denials(&self) {
        self.approval_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_confirmations(&self) {
        self.confirmations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_loop_warnings(&self) {
        self.loop_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_hook_failures(&self, count: u64) {
        self.hook_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            model_requests: self.model_requests.load(Ordering::Relaxed),
            model_failures: self.model_failures.load(Ordering::Relaxed),
            model_retries: self.model_retries.load(Ordering::Relaxed),
            tool_executions: self.tool_executions.load(Ordering::Relaxed),
            tool_failures: self.tool_failures.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            approval_denials: self.approval_denials.load(Ordering::Relaxed),
            confirmations: self.confirmations.load(Ordering::Relaxed),
            loop_warnings: self.loop_warnings.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub model_requests: u64,
    pub model_failures: u64,
    pub model_retries: u64,
    pub tool_executions: u64,
    pub tool_failures: u64,
    pub compactions: u64,
    pub approval_denials: u64,
    pub confirmations: u64,
    pub loop_warnings: u64,
    pub hook_failures: u64,
}

impl MetricsSnapshot {
    pub fn model_success_rate(&self) -> f64 {
        if self.model_requests == 0 {
            return 1.0;
        }
        1.0 - (self.model_failures as f64 / self.model_requests as f64)
    }

    pub fn tool_success_rate(&self) -> f64 {
        if self.tool_executions == 0 {
            return 1.0;
        }
        1.0 - (self.tool_failures as f64 / self.tool_executions as f64)
    }
}

/// RAII timer that records a latency histogram on drop.
pub struct MetricTimer {
    start: Instant,
    metric_name: &'static str,
}

impl MetricTimer {
    pub fn model_request() -> Self {
        Self::new("model_request_latency")
    }

    pub fn tool_execution() -> Self {
        Self::new("tool_execution_latency")
    }

    pub fn turn() -> Self {
        Self::new("turn_duration")
    }

    fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!(self.metric_name, duration_ms);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_rates() {
        let metrics = Metrics::new();
        for _ in 0..4 {
            metrics.inc_tool_executions();
        }
        metrics.inc_tool_failures();
        metrics.add_hook_failures(2);
        {
            let _timer = MetricTimer::tool_execution();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.tool_executions, 4);
        assert_eq!(snap.hook_failures, 2);
        assert!((snap.tool_success_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(snap.model_success_rate(), 1.0);
    }
}
