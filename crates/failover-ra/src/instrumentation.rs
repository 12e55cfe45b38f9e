//! Agent instrumentation.
//!
//! Lock-free counters and gauges for the reconfiguration agent. The node
//! driver exports them; the state machine only increments.
//!
//! ```ignore
//! use failover_ra::instrumentation::METRICS;
//!
//! METRICS.increment_messages_accepted();
//! METRICS.set_failover_units(table.len() as u64);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Agent Metrics
// ============================================================================

/// Global metrics instance for the agent.
pub static METRICS: Metrics = Metrics::new();

const JOB_LATENCY_BOUNDS_MS: [f64; 7] = [0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 50.0];

#[derive(Debug)]
pub struct Metrics {
    // === Message Filter ===
    messages_accepted_total: AtomicU64,
    messages_stale_total: AtomicU64,
    messages_read_only_total: AtomicU64,
    messages_generation_rejected_total: AtomicU64,

    // === Job Queue ===
    jobs_executed_total: AtomicU64,
    job_latency_buckets: [AtomicU64; 7],
    job_latency_sum_ns: AtomicU64,
    job_latency_count: AtomicU64,
    inbox_rejected_total: AtomicU64,

    // === Reconfiguration ===
    reconfigurations_started_total: AtomicU64,
    reconfigurations_completed_total: AtomicU64,
    reconfigurations_aborted_total: AtomicU64,

    // === Lifecycle ===
    replicas_dropped_total: AtomicU64,
    health_warnings_total: AtomicU64,
    upgrades_completed_total: AtomicU64,

    // === Gauges ===
    failover_units: AtomicU64,
    pending_jobs: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            messages_accepted_total: AtomicU64::new(0),
            messages_stale_total: AtomicU64::new(0),
            messages_read_only_total: AtomicU64::new(0),
            messages_generation_rejected_total: AtomicU64::new(0),
            jobs_executed_total: AtomicU64::new(0),
            job_latency_buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            job_latency_sum_ns: AtomicU64::new(0),
            job_latency_count: AtomicU64::new(0),
            inbox_rejected_total: AtomicU64::new(0),
            reconfigurations_started_total: AtomicU64::new(0),
            reconfigurations_completed_total: AtomicU64::new(0),
            reconfigurations_aborted_total: AtomicU64::new(0),
            replicas_dropped_total: AtomicU64::new(0),
            health_warnings_total: AtomicU64::new(0),
            upgrades_completed_total: AtomicU64::new(0),
            failover_units: AtomicU64::new(0),
            pending_jobs: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub fn increment_messages_accepted(&self) {
        self.messages_accepted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_messages_stale(&self) {
        self.messages_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A stale message was answered without mutating state.
    pub fn increment_messages_read_only(&self) {
        self.messages_read_only_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_messages_generation_rejected(&self) {
        self.messages_generation_rejected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_executed(&self) {
        self.jobs_executed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_inbox_rejected(&self) {
        self.inbox_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconfigurations_started(&self) {
        self.reconfigurations_started_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconfigurations_completed(&self) {
        self.reconfigurations_completed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconfigurations_aborted(&self) {
        self.reconfigurations_aborted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_replicas_dropped(&self) {
        self.replicas_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_health_warnings(&self) {
        self.health_warnings_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_upgrades_completed(&self) {
        self.upgrades_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Latency
    // ========================================================================

    /// Records the wall time of one drain of the job queue.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_job_latency(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.job_latency_sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.job_latency_count.fetch_add(1, Ordering::Relaxed);

        let ms = duration.as_secs_f64() * 1000.0;
        for (i, &bound) in JOB_LATENCY_BOUNDS_MS.iter().enumerate() {
            if ms <= bound {
                self.job_latency_buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    // ========================================================================
    // Gauges
    // ========================================================================

    pub fn set_failover_units(&self, count: u64) {
        self.failover_units.store(count, Ordering::Relaxed);
    }

    pub fn set_pending_jobs(&self, count: u64) {
        self.pending_jobs.store(count, Ordering::Relaxed);
    }

    // ========================================================================
    // Metric Export
    // ========================================================================

    /// Exports all metrics in Prometheus exposition format.
    #[allow(clippy::cast_precision_loss)]
    pub fn export_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut output = String::new();

        let counters = [
            ("ra_messages_accepted_total", "Messages that passed the staleness filter", &self.messages_accepted_total),
            ("ra_messages_stale_total", "Messages dropped as stale", &self.messages_stale_total),
            ("ra_messages_read_only_total", "Stale messages answered without mutation", &self.messages_read_only_total),
            ("ra_messages_generation_rejected_total", "Messages rejected on generation", &self.messages_generation_rejected_total),
            ("ra_jobs_executed_total", "Job items executed", &self.jobs_executed_total),
            ("ra_inbox_rejected_total", "Events rejected by a full inbox", &self.inbox_rejected_total),
            ("ra_reconfigurations_started_total", "Reconfigurations started", &self.reconfigurations_started_total),
            ("ra_reconfigurations_completed_total", "Reconfigurations completed", &self.reconfigurations_completed_total),
            ("ra_reconfigurations_aborted_total", "Reconfigurations reverted", &self.reconfigurations_aborted_total),
            ("ra_replicas_dropped_total", "Local replicas dropped", &self.replicas_dropped_total),
            ("ra_health_warnings_total", "Health warnings emitted", &self.health_warnings_total),
            ("ra_upgrades_completed_total", "Upgrades completed", &self.upgrades_completed_total),
        ];
        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }

        let gauges = [
            ("ra_failover_units", "Failover units in the table", &self.failover_units),
            ("ra_pending_jobs", "Job items waiting to run", &self.pending_jobs),
        ];
        for (name, help, value) in gauges {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }

        output.push_str(
            "# HELP ra_job_latency_ms Job item latency histogram\n\
             # TYPE ra_job_latency_ms histogram\n",
        );
        let mut cumulative = 0u64;
        for (i, &bound) in JOB_LATENCY_BOUNDS_MS.iter().enumerate() {
            cumulative += self.job_latency_buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(output, "ra_job_latency_ms_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        let count = self.job_latency_count.load(Ordering::Relaxed);
        let _ = write!(
            output,
            "ra_job_latency_ms_bucket{{le=\"+Inf\"}} {count}\n\
             ra_job_latency_ms_sum {}\n\
             ra_job_latency_ms_count {count}\n",
            self.job_latency_sum_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        );

        output
    }

    /// Returns snapshot of the counters for testing/debugging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_accepted_total: self.messages_accepted_total.load(Ordering::Relaxed),
            messages_stale_total: self.messages_stale_total.load(Ordering::Relaxed),
            messages_read_only_total: self.messages_read_only_total.load(Ordering::Relaxed),
            jobs_executed_total: self.jobs_executed_total.load(Ordering::Relaxed),
            reconfigurations_started_total: self
                .reconfigurations_started_total
                .load(Ordering::Relaxed),
            reconfigurations_completed_total: self
                .reconfigurations_completed_total
                .load(Ordering::Relaxed),
            replicas_dropped_total: self.replicas_dropped_total.load(Ordering::Relaxed),
            health_warnings_total: self.health_warnings_total.load(Ordering::Relaxed),
            failover_units: self.failover_units.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_accepted_total: u64,
    pub messages_stale_total: u64,
    pub messages_read_only_total: u64,
    pub jobs_executed_total: u64,
    pub reconfigurations_started_total: u64,
    pub reconfigurations_completed_total: u64,
    pub replicas_dropped_total: u64,
    pub health_warnings_total: u64,
    pub failover_units: u64,
}
