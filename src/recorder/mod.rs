//! Output side of a session.
//!
//! The engine publishes [`SessionEvent`]s on an [`EventBus`]; recorders and
//! any UI subscribe to it. Nothing published here is ever read back by the
//! engine.

mod sqlite;

pub use sqlite::{RecordedSession, SqliteRecorder};

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::SessionEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Append-only sink for session events.
///
/// `record` is called from the bus pump and must not block; slow sinks hand
/// the work off to their own thread.
pub trait SessionRecorder: Send + Sync {
    fn record(&self, event: &SessionEvent) -> Result<()>;
}

/// Fan-out channel from the engine to every observer.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        debug!("event {}: {}", event.kind(), event.describe());
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

/// Writes every event to the log as a readable line.
#[derive(Debug, Default)]
pub struct LogRecorder;

impl SessionRecorder for LogRecorder {
    fn record(&self, event: &SessionEvent) -> Result<()> {
        match event {
            SessionEvent::ActionFailed { .. }
            | SessionEvent::TelemetryDegraded { .. }
            | SessionEvent::SessionFailed { .. } => warn!("{}", event.describe()),
            SessionEvent::Snapshot { .. } => debug!("{}", event.describe()),
            _ => info!("{}", event.describe()),
        }
        Ok(())
    }
}

/// Feeds everything published on `bus` into `recorder` until the bus closes.
pub fn spawn_pump(bus: &EventBus, recorder: Arc<dyn SessionRecorder>) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(err) = recorder.record(&event) {
                        warn!("Failed to record {} event: {err:#}", event.kind());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Recorder fell behind; {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<String>>);

    impl SessionRecorder for Collecting {
        fn record(&self, event: &SessionEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.kind().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn pump_forwards_until_bus_closes() {
        let bus = EventBus::new(8);
        let sink = Arc::new(Collecting::default());
        let pump = spawn_pump(&bus, sink.clone());

        bus.emit(SessionEvent::BurstSkipped {
            session_id: "s1".into(),
            reason: "paused".into(),
            at: Utc::now(),
        });
        bus.emit(SessionEvent::SessionFailed {
            session_id: "s1".into(),
            reason: "boom".into(),
            at: Utc::now(),
        });
        drop(bus);
        pump.await.unwrap();

        assert_eq!(
            *sink.0.lock().unwrap(),
            vec!["burst_skipped".to_string(), "session_failed".to_string()]
        );
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(SessionEvent::BurstSkipped {
            session_id: "s1".into(),
            reason: "nobody listening".into(),
            at: Utc::now(),
        });
    }
}
