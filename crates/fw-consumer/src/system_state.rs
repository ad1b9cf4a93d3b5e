//! System State Gate (pause/resume + mock-mode selection)
//!
//! A cached view of the singleton system-state row, refreshed on an
//! interval. Drift of up to one refresh interval is accepted; pause is not
//! instantaneous. Writes go through to the store and update the cache
//! immediately.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use fw_channels::MockModeProvider;
use fw_common::{SystemRunState, SystemState};
use fw_store::AlarmStore;

pub struct SystemStateGate {
    store: Arc<dyn AlarmStore>,
    cached: RwLock<SystemState>,
}

impl SystemStateGate {
    /// Create the gate with an initial load; a failed load starts running
    /// (the refresh loop recovers).
    pub async fn new(store: Arc<dyn AlarmStore>) -> Self {
        let initial = match store.get_system_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Initial system-state load failed, assuming running");
                SystemState::default()
            }
        };
        Self {
            store,
            cached: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> SystemState {
        self.cached.read().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.cached.read().is_paused()
    }

    /// Pull the latest row into the cache.
    pub async fn refresh(&self) {
        match self.store.get_system_state().await {
            Ok(state) => {
                let mut cached = self.cached.write();
                if cached.state != state.state {
                    info!(
                        from = cached.state.as_str(),
                        to = state.state.as_str(),
                        "System state changed"
                    );
                }
                *cached = state;
            }
            Err(e) => {
                warn!(error = %e, "System-state refresh failed, keeping cached value");
            }
        }
    }

    /// Pause the whole engine, write-through.
    pub async fn pause(&self, by: &str, reason: &str) -> anyhow::Result<()> {
        let state = SystemState {
            state: SystemRunState::Paused,
            paused_at: Some(Utc::now()),
            paused_by: Some(by.to_string()),
            reason: Some(reason.to_string()),
            ..self.current()
        };
        self.store.set_system_state(&state).await?;
        *self.cached.write() = state;
        info!(by = %by, reason = %reason, "System paused");
        Ok(())
    }

    /// Resume, write-through.
    pub async fn resume(&self) -> anyhow::Result<()> {
        let state = SystemState {
            state: SystemRunState::Running,
            paused_at: None,
            paused_by: None,
            reason: None,
            ..self.current()
        };
        self.store.set_system_state(&state).await?;
        *self.cached.write() = state;
        info!("System resumed");
        Ok(())
    }

    /// Periodic refresh loop; runs until shutdown.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let gate = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        gate.refresh().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("System-state refresher shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl MockModeProvider for SystemStateGate {
    fn use_mock_sms(&self) -> bool {
        self.cached.read().use_mock_sms
    }

    fn use_mock_email(&self) -> bool {
        self.cached.read().use_mock_email
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fw_store::InMemoryAlarmStore;

    #[tokio::test]
    async fn pause_and_resume_write_through() {
        let store = Arc::new(InMemoryAlarmStore::new());
        let gate = SystemStateGate::new(store.clone() as Arc<dyn AlarmStore>).await;

        assert!(!gate.is_paused());

        gate.pause("ops", "maintenance").await.unwrap();
        assert!(gate.is_paused());
        let stored = store.get_system_state().await.unwrap();
        assert_eq!(stored.state, SystemRunState::Paused);
        assert_eq!(stored.paused_by.as_deref(), Some("ops"));

        gate.resume().await.unwrap();
        assert!(!gate.is_paused());
        assert!(store.get_system_state().await.unwrap().paused_at.is_none());
    }

    #[tokio::test]
    async fn refresh_picks_up_external_changes() {
        let store = Arc::new(InMemoryAlarmStore::new());
        let gate = SystemStateGate::new(store.clone() as Arc<dyn AlarmStore>).await;

        store.set_state(SystemState {
            state: SystemRunState::Paused,
            use_mock_sms: true,
            ..SystemState::default()
        });
        assert!(!gate.is_paused()); // stale until refresh

        gate.refresh().await;
        assert!(gate.is_paused());
        assert!(gate.use_mock_sms());
        assert!(!gate.use_mock_email());
    }
}
