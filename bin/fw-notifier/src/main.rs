//! FleetWatch Notifier
//!
//! Consumes alarm events from the AMQP queue and dispatches notifications
//! over email, SMS, and voice. One process hosts the consumer, the alarm
//! processor, the SMS modem pool, the DLQ reprocessor, and the worker
//! registry heartbeat.
//!
//! ## Operations
//!
//! - Pause/resume and mock-mode selection live in the `system_state` table
//!   and take effect within one refresh interval (~10s).
//! - `LOG_FORMAT=json` switches to structured JSON logs.
//! - Prometheus metrics are exposed on `FLEETWATCH_METRICS_PORT`
//!   (default 9090).

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use fw_channels::{EmailAdapter, HttpModemTransport, ModemPool, SmsAdapter, VoiceAdapter};
use fw_channels::{ChannelAdapter, MockModeProvider};
use fw_config::ConfigLoader;
use fw_consumer::{AlarmConsumer, SystemStateGate, WorkerRegistry};
use fw_dispatch::{AlarmProcessor, DlqReprocessor, DlqReprocessorConfig, ProcessorConfig};
use fw_store::{spawn_alarm_created_listener, AlarmStore, PostgresAlarmStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    fw_common::logging::init_logging("fw-notifier");

    info!("Starting FleetWatch Notifier");

    // 1. Configuration (TOML + env overrides + encrypted values)
    let config = ConfigLoader::new().load()?;

    // 2. Metrics recorder
    let metrics_port: u16 = std::env::var("FLEETWATCH_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9090);
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
    {
        warn!(error = %e, "Prometheus exporter unavailable, metrics disabled");
    }

    // 3. Database pool and store
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    let store: Arc<dyn AlarmStore> = Arc::new(PostgresAlarmStore::new(pool.clone()));

    // 4. Shutdown fan-out
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 5. System-state gate (pause/resume + mock modes)
    let gate = Arc::new(SystemStateGate::new(store.clone()).await);
    gate.clone().spawn_refresh_loop(
        Duration::from_secs(config.system_state.refresh_interval_seconds),
        shutdown_tx.subscribe(),
    );
    let mock_mode: Arc<dyn MockModeProvider> = gate.clone();

    // 6. SMS modem pool
    let modem_transport = Arc::new(HttpModemTransport::new(Duration::from_secs(
        config.modem_pool.health_check_timeout_seconds,
    )));
    let modem_pool = Arc::new(ModemPool::new(
        store.clone(),
        modem_transport,
        config.modem_pool.clone(),
    ));
    modem_pool.reload().await?;
    modem_pool
        .clone()
        .spawn_health_check_loop(shutdown_tx.subscribe());

    // 7. Channel adapters
    let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![
        Arc::new(EmailAdapter::new(config.smtp.clone(), mock_mode.clone())),
        Arc::new(SmsAdapter::new(modem_pool.clone(), mock_mode.clone())),
        Arc::new(VoiceAdapter::new(config.voice.clone())),
    ];

    // 8. Alarm processor
    let processor = Arc::new(AlarmProcessor::new(
        store.clone(),
        adapters,
        ProcessorConfig {
            channels: config.channels.clone(),
            circuit_breaker: config.circuit_breaker.clone(),
            dedup_window_minutes: config.dedup.window_minutes,
        },
    ));

    // 9. DLQ reprocessor
    let reprocessor = Arc::new(DlqReprocessor::new(
        store.clone(),
        processor.clone(),
        DlqReprocessorConfig::from_dlq_config(&config.dlq),
    ));
    reprocessor.clone().spawn_loop(shutdown_tx.subscribe());

    // 10. Worker registry
    let registry = Arc::new(WorkerRegistry::new(
        store.clone(),
        config.worker_registry.clone(),
    ));
    registry.register().await?;
    registry.clone().spawn_heartbeat_loop(shutdown_tx.subscribe());
    registry.clone().spawn_cleanup_loop(shutdown_tx.subscribe());

    // 11. Retention sweeps (old audit rows, terminal DLQ rows)
    spawn_retention_sweep(store.clone(), config.database.audit_retention_days,
        config.database.dlq_retention_days, shutdown_tx.subscribe());

    // 12. Optional alarm_created monitor
    spawn_alarm_created_listener(pool.clone(), shutdown_tx.subscribe());

    // 13. AMQP consumer (runs in the foreground until shutdown)
    let consumer = Arc::new(AlarmConsumer::new(
        config.amqp.clone(),
        store.clone(),
        processor.clone(),
        gate.clone(),
    ));
    let consumer_handle = {
        let consumer = consumer.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };

    info!(
        queue = %config.amqp.queue,
        prefetch = config.amqp.prefetch,
        worker = registry.worker_id(),
        "FleetWatch Notifier running"
    );

    // 14. Graceful shutdown: stop consuming, drain, deregister
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    consumer.stop();
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(Duration::from_secs(45), consumer_handle)
        .await
        .is_err()
    {
        warn!("Consumer did not stop within the drain window");
    }

    registry.deregister().await;
    pool.close().await;

    info!("FleetWatch Notifier stopped");
    Ok(())
}

/// Daily cleanup of old audit rows and terminal DLQ rows.
fn spawn_retention_sweep(
    store: Arc<dyn AlarmStore>,
    audit_retention_days: u32,
    dlq_retention_days: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    match store
                        .cleanup_attempts(now - ChronoDuration::days(audit_retention_days as i64))
                        .await
                    {
                        Ok(removed) if removed > 0 => info!(removed = removed, "Old audit rows removed"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Audit cleanup failed"),
                    }
                    match store
                        .cleanup_dlq(now - ChronoDuration::days(dlq_retention_days as i64))
                        .await
                    {
                        Ok(removed) if removed > 0 => info!(removed = removed, "Old DLQ rows removed"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "DLQ cleanup failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}
