//! CPU and memory usage of this process.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::worker::sleep_while_alive;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// CPU time used since the previous sample relative to one core, in
    /// percent. Exceeds 100 on multi-core machines.
    pub cpu_percent: f32,
    /// Resident set size.
    pub rss_bytes: u64,
}

impl TelemetryRecord {
    pub fn memory_display(&self) -> String {
        format_memory(self.rss_bytes)
    }
}

/// Format `bytes` as mebibytes with two decimals, e.g. `"123.45 MB"`.
pub fn format_memory(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// The most recent telemetry record, for the presentation layer.
#[derive(Clone, Default)]
pub struct TelemetryReader {
    latest: Arc<Mutex<Option<TelemetryRecord>>>,
}

impl TelemetryReader {
    pub fn latest(&self) -> Option<TelemetryRecord> {
        *self.latest.lock()
    }
}

pub struct TelemetryWorker {
    system: System,
    pid: Option<Pid>,
    interval: Duration,
    latest: Arc<Mutex<Option<TelemetryRecord>>>,
}

impl TelemetryWorker {
    /// Create a worker publishing to `reader`.
    pub fn new(reader: &TelemetryReader, interval: Duration) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("cannot identify own process, telemetry disabled: {e}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
            interval,
            latest: reader.latest.clone(),
        }
    }

    /// Refresh the process statistics and return a new record.
    ///
    /// CPU usage is measured since the previous call, so the first call
    /// after creation reports 0.
    pub fn sample(&mut self) -> Option<TelemetryRecord> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            warn!("cannot sample process {pid}");
            return None;
        }
        let process = self.system.process(pid)?;
        let record = TelemetryRecord {
            timestamp: chrono::Utc::now(),
            cpu_percent: process.cpu_usage(),
            rss_bytes: process.memory(),
        };
        *self.latest.lock() = Some(record);
        Some(record)
    }

    /// Sample once per interval until `flag` is stopped.
    pub fn run(mut self, flag: &thread_control::Flag) -> u64 {
        // Establish the CPU time baseline.
        let _ = self.sample();
        let mut n_samples = 0;
        while sleep_while_alive(flag, self.interval) {
            if let Some(record) = self.sample() {
                info!(
                    cpu_percent = record.cpu_percent,
                    rss_bytes = record.rss_bytes,
                    "CPU Usage: {:.1}% | RAM Usage: {}",
                    record.cpu_percent,
                    record.memory_display(),
                );
                n_samples += 1;
            }
        }
        debug!("telemetry done after {n_samples} samples");
        n_samples
    }
}
