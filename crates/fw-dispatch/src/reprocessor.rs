//! DLQ Reprocessor - Periodic replay of terminally-failed alarms
//!
//! Each cycle reads the DLQ summary, filters by circuit-breaker state, and
//! replays up to a batch of items ordered `(attempts asc, age asc)`. The
//! cycle cadence is the backoff for automatic replay (items pass with
//! `force = true`); per-item exponential backoff applies to manual
//! single-item replay without force. The DLQ-size alert is edge-triggered.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::circuit_breaker::ChannelBreakers;
use crate::metrics;
use crate::processor::{AlarmProcessor, ProcessOutcome};
use fw_common::{Alarm, Channel, DlqItem};
use fw_config::DlqConfig;
use fw_store::AlarmStore;

/// Reprocessor tuning, lifted from the application config.
#[derive(Debug, Clone)]
pub struct DlqReprocessorConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub alert_threshold: i64,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Optional cycle-level filters.
    pub channel: Option<Channel>,
    pub error_type: Option<String>,
}

impl DlqReprocessorConfig {
    pub fn from_dlq_config(config: &DlqConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.auto_reprocess_interval_seconds),
            batch_size: config.batch_size,
            alert_threshold: config.alert_threshold,
            backoff_base: Duration::from_secs(config.backoff_base_seconds),
            backoff_max: Duration::from_secs(config.backoff_max_seconds),
            channel: None,
            error_type: None,
        }
    }
}

/// Outcome counts for one reprocess cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub examined: u32,
    pub reprocessed: u32,
    pub failed: u32,
    pub skipped: u32,
}

pub struct DlqReprocessor {
    store: Arc<dyn AlarmStore>,
    processor: Arc<AlarmProcessor>,
    breakers: Arc<ChannelBreakers>,
    config: DlqReprocessorConfig,
    alert_raised: AtomicBool,
}

impl DlqReprocessor {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        processor: Arc<AlarmProcessor>,
        config: DlqReprocessorConfig,
    ) -> Self {
        let breakers = processor.breakers();
        Self {
            store,
            processor,
            breakers,
            config,
            alert_raised: AtomicBool::new(false),
        }
    }

    /// One automatic replay cycle.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleStats> {
        let summary = self.store.dlq_summary().await?;
        metrics::set_dlq_depth(summary.total);
        self.check_alert(summary.total);

        if summary.total == 0 {
            return Ok(CycleStats::default());
        }

        // Breaker gate: replay only channels whose breaker is CLOSED.
        let open_channels: Vec<Channel> = Channel::ALL
            .iter()
            .copied()
            .filter(|c| !self.breakers.is_closed(*c))
            .collect();
        if open_channels.len() == Channel::ALL.len() {
            debug!("All channel breakers open, skipping reprocess cycle");
            return Ok(CycleStats::default());
        }
        if !open_channels.is_empty() {
            debug!(?open_channels, "Reprocessing only closed-breaker channels");
        }

        let items = self
            .store
            .fetch_dlq_batch(
                self.config.batch_size,
                self.config.channel,
                self.config.error_type.as_deref(),
            )
            .await?;

        let mut stats = CycleStats::default();
        for item in items {
            stats.examined += 1;

            if !self.breakers.is_closed(item.channel) {
                stats.skipped += 1;
                continue;
            }

            // Cycle cadence is the backoff for automatic replay.
            match self.reprocess_item(&item, true).await {
                Ok(true) => stats.reprocessed += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    stats.failed += 1;
                    debug!(dlq_id = item.id, error = %e, "Replay failed, item left untouched");
                }
            }
        }

        info!(
            examined = stats.examined,
            reprocessed = stats.reprocessed,
            failed = stats.failed,
            skipped = stats.skipped,
            dlq_total = summary.total,
            "DLQ reprocess cycle complete"
        );
        Ok(stats)
    }

    /// Replay a single item. `force` skips the already-reprocessed check and
    /// the per-item backoff (manual operator replay and the auto cycle both
    /// use it; the auto cycle's cadence is its backoff).
    ///
    /// Returns Ok(true) when the item was replayed and marked reprocessed,
    /// Ok(false) when it was skipped; a failed replay is an Err and leaves
    /// the item untouched (a re-failure creates a new DLQ item).
    pub async fn reprocess_item(&self, item: &DlqItem, force: bool) -> anyhow::Result<bool> {
        if !force {
            if item.reprocessed {
                anyhow::bail!("DLQ item {} already reprocessed", item.id);
            }
            if !self.backoff_elapsed(item) {
                debug!(dlq_id = item.id, attempts = item.attempts, "Per-item backoff not elapsed");
                return Ok(false);
            }
        }

        // Payload shape check before deserializing the full alarm.
        let shape_ok = ["id", "imei", "status"]
            .iter()
            .all(|key| item.payload.get(key).is_some());
        if !shape_ok {
            warn!(dlq_id = item.id, "DLQ payload missing required fields, skipping");
            return Ok(false);
        }

        let mut alarm: Alarm = serde_json::from_value(item.payload.clone())?;
        // Replay targets this item's channel; whatever already went out
        // stays guarded by the audit-log idempotency check anyway.
        alarm.is_email = alarm.is_email || item.channel == Channel::Email;
        alarm.is_sms = alarm.is_sms || item.channel == Channel::Sms;
        alarm.is_call = alarm.is_call || item.channel == Channel::Voice;

        let report = self.processor.process_alarm(alarm).await?;
        match report.outcome {
            ProcessOutcome::Invalid => {
                metrics::record_dlq_reprocessed(false);
                anyhow::bail!("DLQ item {} replayed as invalid", item.id)
            }
            _ => {
                let failed = report.channels.iter().any(|(_, outcome)| {
                    matches!(outcome, crate::processor::ChannelOutcome::Failed { .. })
                });
                if failed {
                    metrics::record_dlq_reprocessed(false);
                    anyhow::bail!("DLQ item {} failed again on replay", item.id);
                }
                self.store.mark_dlq_reprocessed(item.id, Utc::now()).await?;
                metrics::record_dlq_reprocessed(true);
                info!(dlq_id = item.id, alarm_id = item.alarm_id, "DLQ item reprocessed");
                Ok(true)
            }
        }
    }

    /// Per-item exponential backoff with jitter; items older than an hour
    /// wait half as long.
    fn backoff_elapsed(&self, item: &DlqItem) -> bool {
        let last_attempt = match item.last_attempt_at {
            Some(at) => at,
            None => return true,
        };

        let exponent = (item.attempts.max(0) as u32).min(16);
        let base = self.config.backoff_base.as_secs_f64() * 2f64.powi(exponent as i32);
        let mut delay = base.min(self.config.backoff_max.as_secs_f64());

        let age = Utc::now() - item.created_at;
        if age > ChronoDuration::hours(1) {
            delay /= 2.0;
        }
        delay *= rand::rng().random_range(0.8..1.2);

        Utc::now() - last_attempt >= ChronoDuration::seconds(delay as i64)
    }

    /// Edge-triggered alert on DLQ size.
    fn check_alert(&self, total: i64) {
        if total >= self.config.alert_threshold {
            if !self.alert_raised.swap(true, Ordering::SeqCst) {
                warn!(
                    total = total,
                    threshold = self.config.alert_threshold,
                    "DLQ size crossed alert threshold"
                );
            }
        } else if self.alert_raised.swap(false, Ordering::SeqCst) {
            info!(total = total, "DLQ size back below alert threshold");
        }
    }

    /// Whether the size alert is currently raised.
    pub fn alert_active(&self) -> bool {
        self.alert_raised.load(Ordering::SeqCst)
    }

    /// Periodic replay loop; runs until shutdown.
    pub fn spawn_loop(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let reprocessor = self;
        let interval = reprocessor.config.interval.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would race service startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reprocessor.run_cycle().await {
                            warn!(error = %e, "DLQ reprocess cycle errored");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("DLQ reprocessor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
