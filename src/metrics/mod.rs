mod types;

pub use types::ProcessUsage;

use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

/// Samples this process's own CPU and memory for session snapshots.
#[derive(Clone)]
pub struct ProcessMetrics {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    system: System,
    pid: Pid,
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta between refreshes; take the baseline now.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState { system, pid })),
        }
    }

    pub async fn sample(&self) -> Option<ProcessUsage> {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        state.system.process(pid).map(|process| ProcessUsage {
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn samples_own_process() {
        let metrics = ProcessMetrics::new();
        let usage = metrics.sample().await.expect("own process is visible");
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_percent >= 0.0);
    }
}
