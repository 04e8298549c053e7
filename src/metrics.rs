//! Prometheus metrics for a run
//!
//! Host loops update the counters concurrently; every update is an atomic
//! increment, so no locking is involved. After the run the registry can be
//! dumped in the Prometheus text format (`--metrics-file`).
//!
//! # Available Metrics
//!
//! - `goss_tasks_total{outcome}` - Counter of finished tasks (success, failed, skipped)
//! - `goss_task_duration_seconds{kind}` - Histogram of task durations per task type
//! - `goss_host_connections_total{outcome}` - Counter of connection attempts (success, failed)
//! - `goss_active_hosts` - Gauge of host loops currently past the admission gate
//! - `goss_peak_memory_bytes` - Gauge of peak process memory (RSS)

use crate::models::TaskStatus;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Histogram bucket boundaries for task duration metrics (in seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0];

/// Run-wide counters
#[derive(Clone)]
pub struct RunMetrics {
    registry: Arc<Registry>,
    tasks: IntCounterVec,
    task_duration: HistogramVec,
    connections: IntCounterVec,
    active_hosts: IntGauge,
    peak_memory: Gauge,
}

impl RunMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tasks = IntCounterVec::new(
            Opts::new("goss_tasks_total", "Total number of finished tasks"),
            &["outcome"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new("goss_task_duration_seconds", "Task duration in seconds")
                .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["kind"],
        )?;
        let connections = IntCounterVec::new(
            Opts::new("goss_host_connections_total", "Connection attempts per outcome"),
            &["outcome"],
        )?;
        let active_hosts = IntGauge::with_opts(Opts::new(
            "goss_active_hosts",
            "Host loops currently running",
        ))?;
        let peak_memory = Gauge::with_opts(Opts::new(
            "goss_peak_memory_bytes",
            "Peak process memory usage in bytes (RSS)",
        ))?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(active_hosts.clone()))?;
        registry.register(Box::new(peak_memory.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            tasks,
            task_duration,
            connections,
            active_hosts,
            peak_memory,
        })
    }

    /// Record a finished task
    ///
    /// Skipped tasks are counted but not timed.
    pub fn record_task(&self, kind: &str, status: TaskStatus, duration_secs: f64) {
        self.tasks.with_label_values(&[&status.to_string()]).inc();
        if status != TaskStatus::Skipped {
            self.task_duration
                .with_label_values(&[kind])
                .observe(duration_secs);
        }
    }

    pub fn record_connection(&self, success: bool) {
        let outcome = if success { "success" } else { "failed" };
        self.connections.with_label_values(&[outcome]).inc();
    }

    pub fn inc_active_hosts(&self) {
        self.active_hosts.inc();
    }

    pub fn dec_active_hosts(&self) {
        self.active_hosts.dec();
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> u64 {
        self.tasks.with_label_values(&[&status.to_string()]).get()
    }

    pub fn connections_with_outcome(&self, success: bool) -> u64 {
        let outcome = if success { "success" } else { "failed" };
        self.connections.with_label_values(&[outcome]).get()
    }

    pub fn active_hosts(&self) -> i64 {
        self.active_hosts.get()
    }

    /// Prometheus text exposition of every metric
    pub fn encode_text(&self) -> anyhow::Result<String> {
        if let Ok(memory) = get_memory_usage() {
            self.peak_memory.set(memory as f64);
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn write_to_file(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.encode_text()?)?;
        debug!("Metrics written to {}", path.display());
        Ok(())
    }
}

/// Get peak process memory usage in bytes (RSS)
#[cfg(target_os = "macos")]
fn get_memory_usage() -> anyhow::Result<u64> {
    use std::mem;

    unsafe {
        let mut info: libc::rusage = mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut info) == 0 {
            // ru_maxrss is in bytes on macOS
            Ok(info.ru_maxrss as u64)
        } else {
            Err(anyhow::anyhow!("Failed to get memory usage"))
        }
    }
}

/// Get peak process memory usage in bytes (RSS)
#[cfg(target_os = "linux")]
fn get_memory_usage() -> anyhow::Result<u64> {
    use std::mem;

    unsafe {
        let mut info: libc::rusage = mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut info) == 0 {
            // ru_maxrss is in kilobytes on Linux
            Ok((info.ru_maxrss as u64) * 1024)
        } else {
            Err(anyhow::anyhow!("Failed to get memory usage"))
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn get_memory_usage() -> anyhow::Result<u64> {
    Err(anyhow::anyhow!(
        "Memory usage tracking not supported on this platform"
    ))
}
