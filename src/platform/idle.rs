use anyhow::{anyhow, Result};
use log::warn;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::IdleSettings;
use crate::models::IdleSample;

use super::InputTelemetry;

/// Idle clock that ignores input this process synthesized itself.
///
/// The OS only knows "time since the last input". Every action the scheduler
/// performs is marked here; an OS-reported input that lands within
/// `synthetic_window` of such a mark is attributed to us and does not reset
/// the genuine-idle clock.
pub struct IdleMonitor {
    telemetry: Arc<dyn InputTelemetry>,
    synthetic_window: Duration,
    query_timeout: Duration,
    fallback_idle_secs: f64,
    inner: Mutex<IdleInner>,
}

struct IdleInner {
    started: Instant,
    last_genuine_input: Option<Instant>,
    last_synthetic: Option<Instant>,
    idle_degraded: Option<String>,
    lock_degraded: Option<String>,
    pending_notices: Vec<String>,
}

impl IdleMonitor {
    pub fn new(telemetry: Arc<dyn InputTelemetry>, settings: &IdleSettings) -> Self {
        Self {
            telemetry,
            synthetic_window: Duration::from_millis(settings.synthetic_window_ms),
            query_timeout: Duration::from_millis(settings.query_timeout_ms),
            fallback_idle_secs: settings.fallback_idle_secs.max(0.0),
            inner: Mutex::new(IdleInner {
                started: Instant::now(),
                last_genuine_input: None,
                last_synthetic: None,
                idle_degraded: None,
                lock_degraded: None,
                pending_notices: Vec::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, IdleInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records that this process just produced input.
    pub fn mark_synthetic(&self, at: Instant) {
        self.inner().last_synthetic = Some(at);
    }

    pub fn is_degraded(&self) -> bool {
        self.inner().idle_degraded.is_some()
    }

    /// Degradation reasons not yet reported; each is returned exactly once.
    pub fn take_degradation_notices(&self) -> Vec<String> {
        std::mem::take(&mut self.inner().pending_notices)
    }

    /// Current genuine idle time. Falls back to the configured constant for the
    /// rest of the session once the OS query fails or times out.
    pub async fn sample(&self) -> IdleSample {
        if self.is_degraded() {
            return IdleSample::new(self.fallback_idle_secs, true);
        }

        let telemetry = Arc::clone(&self.telemetry);
        let result = bounded(self.query_timeout, move || telemetry.idle_seconds()).await;

        match result {
            Ok(os_idle) if os_idle.is_finite() => {
                let idle = self.attribute(os_idle.max(0.0), Instant::now());
                IdleSample::new(idle, false)
            }
            Ok(os_idle) => {
                self.degrade_idle(format!("idle query returned {os_idle}"));
                IdleSample::new(self.fallback_idle_secs, true)
            }
            Err(err) => {
                self.degrade_idle(format!("{err:#}"));
                IdleSample::new(self.fallback_idle_secs, true)
            }
        }
    }

    /// Lock state; `false` for the rest of the session once the query fails.
    pub async fn is_locked(&self) -> bool {
        if self.inner().lock_degraded.is_some() {
            return false;
        }

        let telemetry = Arc::clone(&self.telemetry);
        match bounded(self.query_timeout, move || telemetry.is_locked()).await {
            Ok(locked) => locked,
            Err(err) => {
                let reason = format!("lock query failed: {err:#}");
                let mut inner = self.inner();
                if inner.lock_degraded.is_none() {
                    warn!("Lock telemetry unavailable, assuming unlocked: {reason}");
                    inner.lock_degraded = Some(reason.clone());
                    inner.pending_notices.push(reason);
                }
                false
            }
        }
    }

    fn degrade_idle(&self, reason: String) {
        let mut inner = self.inner();
        if inner.idle_degraded.is_none() {
            warn!(
                "Idle telemetry unavailable, reporting {}s idle for this session: {reason}",
                self.fallback_idle_secs
            );
            inner.idle_degraded = Some(reason.clone());
            inner.pending_notices.push(format!("idle query failed: {reason}"));
        }
    }

    /// Folds one OS idle reading into the genuine-idle clock.
    pub(crate) fn attribute(&self, os_idle: f64, now: Instant) -> f64 {
        let mut inner = self.inner();
        let Some(input_at) = now.checked_sub(Duration::from_secs_f64(os_idle)) else {
            return os_idle;
        };

        let ours = inner.last_synthetic.is_some_and(|synthetic| {
            let gap = if input_at >= synthetic {
                input_at - synthetic
            } else {
                synthetic - input_at
            };
            gap <= self.synthetic_window
        });

        if ours {
            let genuine = inner.last_genuine_input.unwrap_or(inner.started);
            return now.saturating_duration_since(genuine).as_secs_f64();
        }

        if inner.last_genuine_input.map_or(true, |prev| input_at > prev) {
            inner.last_genuine_input = Some(input_at);
        }
        inner
            .last_genuine_input
            .map(|genuine| now.saturating_duration_since(genuine).as_secs_f64())
            .unwrap_or(os_idle)
    }
}

/// Runs a blocking OS query with an upper bound on how long we wait for it.
async fn bounded<T, F>(timeout: Duration, query: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(query)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(anyhow!("telemetry worker failed: {join_err}")),
        Err(_) => Err(anyhow!("telemetry query timed out after {timeout:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTelemetry;

    fn monitor(telemetry: Arc<ScriptedTelemetry>) -> IdleMonitor {
        IdleMonitor::new(telemetry, &IdleSettings::default())
    }

    #[test]
    fn own_input_does_not_reset_idle_clock() {
        let telemetry = Arc::new(ScriptedTelemetry::new(0.0));
        let monitor = monitor(telemetry);
        let t0 = Instant::now();

        // genuine input 40s before t0 + 40
        let now = t0 + Duration::from_secs(40);
        assert_eq!(monitor.attribute(40.0, now), 40.0);

        // we moved the cursor at t0 + 50; the OS now reports 0.5s idle
        monitor.mark_synthetic(t0 + Duration::from_secs(50));
        let now = t0 + Duration::from_millis(50_500);
        let idle = monitor.attribute(0.5, now);
        assert!((idle - 50.5).abs() < 0.01, "idle was {idle}");
    }

    #[test]
    fn user_input_after_synthetic_window_counts() {
        let telemetry = Arc::new(ScriptedTelemetry::new(0.0));
        let monitor = monitor(telemetry);
        let t0 = Instant::now();
        monitor.attribute(10.0, t0 + Duration::from_secs(10));

        monitor.mark_synthetic(t0 + Duration::from_secs(20));
        let idle = monitor.attribute(1.0, t0 + Duration::from_secs(30));
        assert!((idle - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn failing_telemetry_degrades_once() {
        let telemetry = Arc::new(ScriptedTelemetry::unavailable());
        let monitor = monitor(telemetry);

        let first = monitor.sample().await;
        let second = monitor.sample().await;
        assert!(first.degraded && second.degraded);
        assert_eq!(first.idle_seconds, 0.0);
        assert!(!monitor.is_locked().await);
        assert_eq!(monitor.take_degradation_notices().len(), 2);
        assert!(monitor.take_degradation_notices().is_empty());
    }

    #[tokio::test]
    async fn hung_query_times_out() {
        let telemetry = Arc::new(ScriptedTelemetry::new(5.0).with_delay(Duration::from_millis(300)));
        let settings = IdleSettings {
            query_timeout_ms: 50,
            ..IdleSettings::default()
        };
        let monitor = IdleMonitor::new(telemetry, &settings);
        let sample = monitor.sample().await;
        assert!(sample.degraded);
    }
}
