use std::time::{Duration, Instant};

use stayactive_lib::config::{IntensityProfile, SimulatorConfig};
use stayactive_lib::error::{ConfigError, SessionError};
use stayactive_lib::models::{
    ActionCategory, ArtifactStatus, Mode, PauseStatus, SessionEvent, SessionSnapshot,
    SessionStatus,
};
use stayactive_lib::recorder::EventBus;
use stayactive_lib::session::SessionController;
use stayactive_lib::testing::FakeDesktop;
use tokio::sync::broadcast;

const TICK: Duration = Duration::from_millis(100);
/// Idle time of a user who walked away.
const AWAY: f64 = 1_000.0;

/// One action per second, no companion, and no synthetic-input attribution so
/// scripted idle values reach the state machines unchanged.
fn fast_config() -> SimulatorConfig {
    let mut config = SimulatorConfig::default();
    config.intensity = IntensityProfile::Custom;
    config.min_interval_secs = 1;
    config.max_interval_secs = 1;
    config.burst_enabled = false;
    config.companion.enabled = false;
    config.idle.synthetic_window_ms = 0;
    config
}

fn controller(desktop: &FakeDesktop) -> SessionController {
    SessionController::with_tick(desktop.platform(), EventBus::default(), TICK)
}

async fn wait_until<F>(controller: &SessionController, timeout: Duration, done: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = controller.snapshot().await.expect("session exists");
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "condition not reached in {timeout:?}; last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_a_long_sleep() {
    let desktop = FakeDesktop::new(AWAY);
    let controller = controller(&desktop);
    let mut config = fast_config();
    config.min_interval_secs = 60;
    config.max_interval_secs = 60;

    controller.start(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let summary = controller.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.status, SessionStatus::Stopped);
    assert_eq!(summary.activities_performed, 0);
    assert_eq!(desktop.input.count(), 0);
    assert_eq!(controller.status().await, SessionStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sustained_user_activity_pauses_bursts() {
    let desktop = FakeDesktop::new(0.0);
    let controller = controller(&desktop);
    let mut config = fast_config();
    config.mode.auto_switch = false;
    config.pause.pause_threshold_secs = 2;
    config.pause.resume_threshold_secs = 60;

    controller.start(config).await.unwrap();
    wait_until(&controller, Duration::from_secs(4), |snapshot| {
        snapshot.pause == Some(PauseStatus::Paused)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let baseline = desktop.input.count();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.pause, Some(PauseStatus::Paused));
    assert_eq!(snapshot.mode, Mode::Automation);
    assert_eq!(desktop.input.count(), baseline);
    controller.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_pause_and_resume_are_idempotent() {
    let desktop = FakeDesktop::new(AWAY);
    let controller = controller(&desktop);
    let mut events = controller.subscribe();
    let mut config = fast_config();
    config.min_interval_secs = 60;
    config.max_interval_secs = 60;

    controller.start(config).await.unwrap();
    assert!(controller.manual_pause().await.unwrap());
    assert!(!controller.manual_pause().await.unwrap());
    assert!(controller.manual_resume().await.unwrap());
    assert!(!controller.manual_resume().await.unwrap());

    let summary = controller.stop().await.unwrap();
    assert_eq!(summary.pause_count, 1);

    let pause_events = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::PauseChanged { .. }))
        .count();
    assert_eq!(pause_events, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_time_is_not_active_time() {
    let desktop = FakeDesktop::new(AWAY);
    let controller = controller(&desktop);
    let mut config = fast_config();
    config.min_interval_secs = 60;
    config.max_interval_secs = 60;

    controller.start(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    controller.manual_pause().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    controller.manual_resume().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let summary = controller.stop().await.unwrap();
    assert!(summary.paused_ms >= 550, "paused {}ms", summary.paused_ms);
    let accounted = summary.active_ms + summary.paused_ms;
    assert!(summary.elapsed_ms.abs_diff(accounted) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counters_only_grow_and_skip_failures() {
    let desktop = FakeDesktop::new(AWAY);
    desktop.input.fail_category(ActionCategory::CursorSweep);
    let controller = controller(&desktop);

    controller.start(fast_config()).await.unwrap();
    let mut last = 0;
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let snapshot = controller.snapshot().await.unwrap();
        assert!(snapshot.activities_performed >= last);
        last = snapshot.activities_performed;
    }
    let summary = controller.stop().await.unwrap();

    let performed = desktop.input.performed();
    assert!(!performed.is_empty());
    let failed = performed
        .iter()
        .filter(|request| request.category == ActionCategory::CursorSweep)
        .count() as u64;
    assert_eq!(summary.failed_actions, failed);
    assert_eq!(summary.activities_performed, performed.len() as u64 - failed);
    assert!(!summary
        .category_counts
        .contains_key(&ActionCategory::CursorSweep));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_config_never_starts() {
    let desktop = FakeDesktop::new(AWAY);
    let controller = controller(&desktop);
    let mut config = fast_config();
    config.min_interval_secs = 10;
    config.max_interval_secs = 5;

    let err = controller.start(config).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Config(ConfigError::IntervalOrder { min: 10, max: 5 })
    ));
    assert_eq!(controller.status().await, SessionStatus::Idle);
    assert!(matches!(
        controller.manual_pause().await,
        Err(SessionError::NotRunning)
    ));

    controller.start(fast_config()).await.unwrap();
    assert!(matches!(
        controller.start(fast_config()).await,
        Err(SessionError::AlreadyRunning)
    ));
    controller.stop().await.unwrap();
    assert!(matches!(controller.stop().await, Err(SessionError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_action_fails_the_session() {
    let desktop = FakeDesktop::new(AWAY);
    desktop.input.panic_on_perform();
    let controller = controller(&desktop);
    let mut events = controller.subscribe();

    controller.start(fast_config()).await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SessionEvent::SessionFailed { reason, .. }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("session failed in time");

    assert!(reason.contains("scheduler"), "reason: {reason}");
    assert_eq!(controller.status().await, SessionStatus::Failed);
    assert!(matches!(controller.stop().await, Err(SessionError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn all_categories_disabled_falls_back_to_key_taps() {
    let desktop = FakeDesktop::new(AWAY);
    let controller = controller(&desktop);
    let mut events = controller.subscribe();
    let mut config = fast_config();
    config.actions.disable_all();

    controller.start(config).await.unwrap();
    wait_until(&controller, Duration::from_secs(4), |snapshot| {
        snapshot.activities_performed >= 2
    })
    .await;
    controller.stop().await.unwrap();

    assert!(desktop
        .input
        .performed()
        .iter()
        .all(|request| request.category == ActionCategory::KeyTap));
    let fallback_burst = drain(&mut events).into_iter().any(|event| match event {
        SessionEvent::BurstCompleted { performed, .. } => {
            performed.iter().any(|action| action.contains("(fallback)"))
        }
        _ => false,
    });
    assert!(fallback_burst);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn locked_session_uses_locked_safe_actions() {
    let desktop = FakeDesktop::new(AWAY);
    desktop.telemetry.set_locked(true);
    let controller = controller(&desktop);

    controller.start(fast_config()).await.unwrap();
    let snapshot = wait_until(&controller, Duration::from_secs(4), |snapshot| {
        snapshot.activities_performed >= 1
    })
    .await;
    assert_eq!(snapshot.mode, Mode::Locked);
    assert_eq!(snapshot.pause, None);
    controller.stop().await.unwrap();

    let performed = desktop.input.performed();
    assert!(performed.iter().all(|request| request.locked));
    assert!(performed
        .iter()
        .all(|request| request.category != ActionCategory::TextEntry));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_in_control_skips_bursts_until_toggled() {
    let desktop = FakeDesktop::new(AWAY);
    let controller = controller(&desktop);
    let mut events = controller.subscribe();

    controller.start(fast_config()).await.unwrap();
    assert_eq!(controller.toggle_mode().await.unwrap(), Mode::UserControlled);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(desktop.input.count(), 0);

    assert_eq!(controller.toggle_mode().await.unwrap(), Mode::Automation);
    wait_until(&controller, Duration::from_secs(3), |snapshot| {
        snapshot.activities_performed >= 1
    })
    .await;
    controller.stop().await.unwrap();

    let skipped_for_user = drain(&mut events).into_iter().any(|event| {
        matches!(event, SessionEvent::BurstSkipped { ref reason, .. } if reason == "user in control")
    });
    assert!(skipped_for_user);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn avoided_window_suppresses_bursts() {
    let desktop = FakeDesktop::new(AWAY);
    desktop.windows.open_window("Weekly sync - Zoom Meeting");
    let controller = controller(&desktop);
    let mut config = fast_config();
    config.avoid_apps = vec!["zoom".into()];

    controller.start(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(desktop.input.count(), 0);
    controller.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_entry_goes_to_the_companion_window() {
    let artifacts = tempfile::tempdir().unwrap();
    let desktop = FakeDesktop::new(AWAY);
    let controller = controller(&desktop);
    let mut config = fast_config();
    config.companion.enabled = true;
    config.companion.settle_delay_ms = 0;
    config.companion.check_interval_secs = 1;
    config.companion.directory = Some(artifacts.path().to_path_buf());
    config.actions.disable_all();
    config.actions.text_entry.enabled = true;

    controller.start(config).await.unwrap();
    wait_until(&controller, Duration::from_secs(5), |snapshot| {
        snapshot.category_counts.contains_key(&ActionCategory::TextEntry)
    })
    .await;
    let summary = controller.stop().await.unwrap();

    let companion = summary.companion.expect("companion view");
    assert_eq!(companion.status, ArtifactStatus::Active);
    let path = companion.path.expect("artifact path");
    assert!(path.starts_with(artifacts.path()));
    assert!(path.exists(), "artifact kept after stop");

    let title = companion.window_title.expect("artifact title");
    assert!(desktop.input.performed().iter().any(|request| {
        request.category == ActionCategory::TextEntry
            && request.target_window.as_deref() == Some(title.as_str())
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_telemetry_keeps_automation_running() {
    let desktop = FakeDesktop::with_telemetry(
        stayactive_lib::testing::ScriptedTelemetry::unavailable(),
    );
    let controller = controller(&desktop);
    let mut events = controller.subscribe();

    controller.start(fast_config()).await.unwrap();
    let snapshot = wait_until(&controller, Duration::from_secs(4), |snapshot| {
        snapshot.activities_performed >= 1
    })
    .await;
    assert!(snapshot.telemetry_degraded);
    assert_eq!(snapshot.mode, Mode::Automation);
    assert_eq!(snapshot.pause, Some(PauseStatus::Active));
    controller.stop().await.unwrap();

    let notices = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::TelemetryDegraded { .. }))
        .count();
    // one for idle, one for lock
    assert_eq!(notices, 2);
}
