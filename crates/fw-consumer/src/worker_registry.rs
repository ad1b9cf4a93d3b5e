//! Worker Registry (liveness heartbeat and stale-worker reaping)
//!
//! Each consumer instance registers `hostname:pid`, heartbeats on an
//! interval, and re-registers if its row vanished. A cleanup timer marks
//! rows stale/dead by heartbeat age and removes dead rows older than an
//! hour.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fw_common::{Worker, WorkerStatus};
use fw_config::WorkerRegistryConfig;
use fw_store::AlarmStore;

pub struct WorkerRegistry {
    store: Arc<dyn AlarmStore>,
    config: WorkerRegistryConfig,
    worker_id: String,
    hostname: String,
    pid: i32,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn AlarmStore>, config: WorkerRegistryConfig) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("host-{}", uuid::Uuid::new_v4().simple()));
        let pid = std::process::id() as i32;
        Self {
            store,
            config,
            worker_id: format!("{}:{}", hostname, pid),
            hostname,
            pid,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Insert (or refresh) this instance's row.
    pub async fn register(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        self.store
            .upsert_worker(&Worker {
                id: self.worker_id.clone(),
                hostname: self.hostname.clone(),
                pid: self.pid,
                started_at: now,
                last_heartbeat: now,
                status: WorkerStatus::Active,
            })
            .await?;
        info!(worker_id = %self.worker_id, "Worker registered");
        Ok(())
    }

    /// One heartbeat; re-registers if the row was removed underneath us.
    pub async fn heartbeat(&self) {
        match self.store.worker_heartbeat(&self.worker_id, Utc::now()).await {
            Ok(true) => {
                debug!(worker_id = %self.worker_id, "Heartbeat");
            }
            Ok(false) => {
                warn!(worker_id = %self.worker_id, "Registry row missing, re-registering");
                if let Err(e) = self.register().await {
                    warn!(worker_id = %self.worker_id, error = %e, "Re-registration failed");
                }
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "Heartbeat failed");
            }
        }
    }

    /// One cleanup pass over all workers.
    pub async fn cleanup(&self) {
        match self
            .store
            .cleanup_workers(
                Utc::now(),
                self.config.stale_after_seconds,
                self.config.dead_after_seconds,
            )
            .await
        {
            Ok(result) => {
                if result.marked_stale + result.marked_dead + result.removed > 0 {
                    info!(
                        stale = result.marked_stale,
                        dead = result.marked_dead,
                        removed = result.removed,
                        "Worker registry cleanup"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Worker registry cleanup failed");
            }
        }
    }

    /// Remove this instance's row on graceful shutdown.
    pub async fn deregister(&self) {
        if let Err(e) = self.store.remove_worker(&self.worker_id).await {
            warn!(worker_id = %self.worker_id, error = %e, "Deregistration failed");
        } else {
            info!(worker_id = %self.worker_id, "Worker deregistered");
        }
    }

    /// Heartbeat loop; runs until shutdown.
    pub fn spawn_heartbeat_loop(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self;
        let interval =
            Duration::from_secs(registry.config.heartbeat_interval_seconds.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.heartbeat().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Heartbeat loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Cleanup loop; runs until shutdown.
    pub fn spawn_cleanup_loop(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self;
        let interval = Duration::from_secs(registry.config.cleanup_interval_seconds.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.cleanup().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Registry cleanup loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fw_store::InMemoryAlarmStore;

    fn registry(store: Arc<InMemoryAlarmStore>) -> WorkerRegistry {
        WorkerRegistry::new(store as Arc<dyn AlarmStore>, WorkerRegistryConfig::default())
    }

    #[tokio::test]
    async fn registers_with_hostname_and_pid() {
        let store = Arc::new(InMemoryAlarmStore::new());
        let registry = registry(store.clone());

        registry.register().await.unwrap();

        let workers = store.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, registry.worker_id());
        assert_eq!(workers[0].status, WorkerStatus::Active);
        assert!(workers[0].id.contains(':'));
    }

    #[tokio::test]
    async fn heartbeat_reregisters_when_row_removed() {
        let store = Arc::new(InMemoryAlarmStore::new());
        let registry = registry(store.clone());

        registry.register().await.unwrap();
        store.remove_worker(registry.worker_id()).await.unwrap();
        assert!(store.workers().is_empty());

        registry.heartbeat().await;
        assert_eq!(store.workers().len(), 1);
    }

    #[tokio::test]
    async fn deregister_removes_row() {
        let store = Arc::new(InMemoryAlarmStore::new());
        let registry = registry(store.clone());

        registry.register().await.unwrap();
        registry.deregister().await;
        assert!(store.workers().is_empty());
    }
}
