//! The orchestration engine: state machines plus the loops that drive them.

pub mod companion;
pub mod loops;
pub mod mode;
pub mod pause;
pub mod scheduler;
pub mod selection;

pub use companion::CompanionMonitor;
pub use loops::LoopFault;
pub use mode::ModeController;
pub use pause::PauseController;
pub use scheduler::ActionScheduler;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::SimulatorConfig;
use crate::metrics::ProcessMetrics;
use crate::models::SessionSnapshot;
use crate::platform::{IdleMonitor, Platform};
use crate::recorder::EventBus;
use crate::session::SessionState;

/// Handles shared by every loop of one session.
#[derive(Clone)]
pub struct EngineContext {
    pub session_id: String,
    pub config: Arc<SimulatorConfig>,
    pub state: Arc<Mutex<SessionState>>,
    pub idle: Arc<IdleMonitor>,
    pub platform: Platform,
    pub companion: Arc<CompanionMonitor>,
    pub metrics: ProcessMetrics,
    pub events: EventBus,
    pub cancel: CancellationToken,
    /// Granularity of every wait; cancellation is observed at least this often.
    pub tick: Duration,
}

impl EngineContext {
    /// Sleeps in `tick`-sized steps. Returns `false` if the session was
    /// cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            let step = (deadline - now).min(self.tick);
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    /// Current snapshot including companion and process figures.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = {
            let state = self.state.lock().await;
            state.snapshot(Instant::now(), self.config.target_percentage)
        };
        if self.companion.enabled() {
            snapshot.companion = Some(self.companion.view().await);
        }
        if let Some(usage) = self.metrics.sample().await {
            snapshot.cpu_percent = Some(usage.cpu_percent);
            snapshot.memory_mb = Some(usage.memory_mb);
        }
        snapshot
    }
}
