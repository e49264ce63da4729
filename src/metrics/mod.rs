mod types;

pub use types::{MetricsSnapshot, PollMetrics, SystemMetrics};

use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_POLLS: usize = 20;

pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
    summary_every_polls: u64,
}

struct MetricsState {
    recent_polls: Vec<PollMetrics>,
    poll_count: u64,
    skipped_ticks: u64,
    failed_polls: u64,
    match_polls: u64,
    system: System,
    pid: Pid,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let debug_mode = std::env::var("PHONELUNK_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_polls: Vec::with_capacity(MAX_RECENT_POLLS),
                poll_count: 0,
                skipped_ticks: 0,
                failed_polls: 0,
                match_polls: 0,
                system,
                pid,
            })),
            summary_every_polls: if debug_mode { 1 } else { 100 },
        }
    }

    /// Sample current CPU and memory usage of this process.
    /// CPU usage requires multiple refreshes over time to calculate delta.
    pub async fn sample_system_metrics(&self) -> SystemMetrics {
        let mut state = self.inner.lock().await;
        state.sample()
    }

    pub async fn record_poll(&self, metrics: PollMetrics) {
        let mut state = self.inner.lock().await;

        state.poll_count += 1;
        if metrics.failed {
            state.failed_polls += 1;
        }
        if metrics.match_count > 0 {
            state.match_polls += 1;
        }

        state.recent_polls.push(metrics);
        if state.recent_polls.len() > MAX_RECENT_POLLS {
            state.recent_polls.remove(0);
        }

        if state.poll_count % self.summary_every_polls == 0 {
            let system = state.sample();
            log::info!(
                "polls={} skipped={} failed={} matched={} cpu={:.1}% mem={:.1}MB",
                state.poll_count,
                state.skipped_ticks,
                state.failed_polls,
                state.match_polls,
                system.cpu_percent,
                system.memory_mb
            );
        }
    }

    pub async fn record_skipped_tick(&self) {
        self.inner.lock().await.skipped_ticks += 1;
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let system = state.sample();

        MetricsSnapshot {
            system,
            recent_polls: state.recent_polls.clone(),
            poll_count: state.poll_count,
            skipped_ticks: state.skipped_ticks,
            failed_polls: state.failed_polls,
            match_polls: state.match_polls,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.recent_polls.clear();
        state.poll_count = 0;
        state.skipped_ticks = 0;
        state.failed_polls = 0;
        state.match_polls = 0;
        // Re-establish baseline for CPU after reset
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    }
}

impl MetricsState {
    fn sample(&mut self) -> SystemMetrics {
        let pid = self.pid;
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        match self.system.process(pid) {
            Some(process) => SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemMetrics::default(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            summary_every_polls: self.summary_every_polls,
        }
    }
}
