//! Alarm Processor - Per-alarm orchestration
//!
//! Pipeline: validate -> dedup gate -> quiet-hours gate -> contact fetch ->
//! concurrent per-channel fan-out, each channel behind its own limiter,
//! breaker, and retry loop. A failure in one channel never fails another;
//! `channel_fallback_enabled` only governs whether collected failures
//! propagate out of `process_alarm`.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::circuit_breaker::ChannelBreakers;
use crate::limiter::ChannelLimiter;
use crate::metrics;
use crate::retry::RetryPolicy;
use fw_channels::{ChannelAdapter, ChannelSendReport, Recipient};
use fw_common::{
    error_type, feature_flags, logging, Alarm, AttemptStatus, Channel, Contact,
    NotificationAttempt,
};
use fw_config::{ChannelsConfig, CircuitBreakerConfig};
use fw_store::{AlarmStore, NewDlqItem};

/// Processor tuning, lifted from the application config.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub channels: ChannelsConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dedup_window_minutes: i64,
}

/// Why an alarm stopped short of fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Fan-out ran (individual channels may still have failed or skipped).
    Processed,
    /// Structural validation failed; the alarm went to the DLQ.
    Invalid,
    /// Suppressed by the dedup window; the occurrence counter was bumped.
    DuplicateSuppressed,
    /// Suppressed by an active quiet-hours rule.
    QuietHours,
}

/// Per-channel outcome inside a process report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Sent,
    Skipped(String),
    Failed { error_type: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub outcome: ProcessOutcome,
    pub channels: Vec<(Channel, ChannelOutcome)>,
}

impl ProcessReport {
    fn gated(outcome: ProcessOutcome) -> Self {
        Self {
            outcome,
            channels: Vec::new(),
        }
    }
}

/// The per-alarm orchestrator (C7)
pub struct AlarmProcessor {
    store: Arc<dyn AlarmStore>,
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    breakers: Arc<ChannelBreakers>,
    limiters: HashMap<Channel, Arc<ChannelLimiter>>,
    retries: HashMap<Channel, RetryPolicy>,
    sla: HashMap<Channel, Duration>,
    dedup_window: ChronoDuration,
}

impl AlarmProcessor {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        config: ProcessorConfig,
    ) -> Self {
        let adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = adapters
            .into_iter()
            .map(|a| (a.channel(), a))
            .collect();

        let mut limiters = HashMap::new();
        let mut retries = HashMap::new();
        let mut sla = HashMap::new();
        for channel in Channel::ALL {
            let channel_config = match channel {
                Channel::Email => &config.channels.email,
                Channel::Sms => &config.channels.sms,
                Channel::Voice => &config.channels.voice,
            };
            limiters.insert(
                channel,
                Arc::new(ChannelLimiter::new(channel_config.max_concurrency)),
            );
            retries.insert(channel, RetryPolicy::from_channel_config(channel_config));
            sla.insert(channel, Duration::from_millis(channel_config.sla_ms));
        }

        Self {
            store,
            adapters,
            breakers: Arc::new(ChannelBreakers::new(&config.circuit_breaker)),
            limiters,
            retries,
            sla,
            dedup_window: ChronoDuration::minutes(config.dedup_window_minutes),
        }
    }

    /// The breaker set, shared with the DLQ reprocessor and operators.
    pub fn breakers(&self) -> Arc<ChannelBreakers> {
        Arc::clone(&self.breakers)
    }

    /// Current in-flight count for a channel.
    pub fn in_flight(&self, channel: Channel) -> u32 {
        self.limiters[&channel].in_flight()
    }

    /// Process one alarm end to end.
    ///
    /// Returns `Err` only when `channel_fallback_enabled` is off and at
    /// least one channel failed terminally; gate suppressions and validation
    /// failures resolve to `Ok` with the corresponding outcome.
    pub async fn process_alarm(&self, alarm: Alarm) -> anyhow::Result<ProcessReport> {
        // 1. Structural validation; failures are parked, never rethrown.
        if let Err(reason) = Self::validate(&alarm) {
            warn!(alarm_id = alarm.id, imei = %alarm.imei, reason = %reason, "Invalid alarm");
            self.park_invalid(&alarm, &reason).await;
            metrics::record_alarm_processed("invalid");
            return Ok(ProcessReport::gated(ProcessOutcome::Invalid));
        }

        let now = Utc::now();

        // 2. Dedup gate
        if self.store.feature_flag(feature_flags::DEDUPLICATION_ENABLED).await? {
            if let Some(record) = self.store.find_dedup(&alarm.imei, &alarm.status).await? {
                if record.last_occurrence >= now - self.dedup_window {
                    self.store
                        .increment_dedup(&alarm.imei, &alarm.status, now)
                        .await?;
                    debug!(
                        alarm_id = alarm.id,
                        imei = %alarm.imei,
                        alarm_type = %alarm.status,
                        occurrences = record.occurrence_count + 1,
                        "Duplicate alarm inside dedup window"
                    );
                    metrics::record_dedup_suppressed();
                    metrics::record_alarm_processed("dedup_suppressed");
                    return Ok(ProcessReport::gated(ProcessOutcome::DuplicateSuppressed));
                }
            }
            self.store.reset_dedup(&alarm.imei, &alarm.status, now).await?;
        }

        // 3. Quiet-hours gate (device-level rule or any contact-level rule)
        let contacts = self.store.active_contacts(&alarm.imei).await?;
        if self.store.feature_flag(feature_flags::QUIET_HOURS_ENABLED).await? {
            let device_rule = self.store.device_quiet_hours(&alarm.imei).await?;
            let device_active = device_rule.map(|q| q.is_active_at(now)).unwrap_or(false);
            let contact_active = contacts
                .iter()
                .filter_map(|c| c.quiet_hours)
                .any(|q| q.is_active_at(now));

            if device_active || contact_active {
                debug!(alarm_id = alarm.id, imei = %alarm.imei, "Quiet hours active, skipping");
                metrics::record_quiet_hours_suppressed();
                metrics::record_alarm_processed("quiet_hours");
                return Ok(ProcessReport::gated(ProcessOutcome::QuietHours));
            }
        }

        // 4. Channel fan-out: enabled, not-yet-sent channels run concurrently.
        let pending = alarm.pending_channels();
        if pending.is_empty() {
            debug!(alarm_id = alarm.id, "No pending channels");
            metrics::record_alarm_processed("no_channels");
            return Ok(ProcessReport::gated(ProcessOutcome::Processed));
        }

        let fallback_enabled = self
            .store
            .feature_flag(feature_flags::CHANNEL_FALLBACK_ENABLED)
            .await?;

        let tasks = pending.iter().map(|channel| {
            self.process_channel(&alarm, *channel, &contacts)
                .instrument(logging::delivery_span(alarm.id, &alarm.imei, channel.as_str()))
        });
        let outcomes: Vec<(Channel, ChannelOutcome)> =
            pending.iter().copied().zip(join_all(tasks).await).collect();

        let failures: Vec<&(Channel, ChannelOutcome)> = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ChannelOutcome::Failed { .. }))
            .collect();

        metrics::record_alarm_processed("processed");

        if !failures.is_empty() && !fallback_enabled {
            let summary: Vec<String> = failures
                .iter()
                .map(|(channel, outcome)| match outcome {
                    ChannelOutcome::Failed { error_type, .. } => {
                        format!("{}:{}", channel, error_type)
                    }
                    _ => unreachable!(),
                })
                .collect();
            anyhow::bail!(
                "Alarm {} failed on {} channel(s): {}",
                alarm.id,
                failures.len(),
                summary.join(", ")
            );
        }

        Ok(ProcessReport {
            outcome: ProcessOutcome::Processed,
            channels: outcomes,
        })
    }

    fn validate(alarm: &Alarm) -> Result<(), String> {
        if alarm.id <= 0 {
            return Err("missing alarm id".to_string());
        }
        if alarm.imei.trim().is_empty() {
            return Err("missing imei".to_string());
        }
        if alarm.status.trim().is_empty() {
            return Err("missing status".to_string());
        }
        Ok(())
    }

    /// Park a structurally invalid alarm in the DLQ with attempts = 0.
    async fn park_invalid(&self, alarm: &Alarm, reason: &str) {
        let channel = alarm
            .pending_channels()
            .first()
            .copied()
            .unwrap_or(Channel::Email);
        let item = NewDlqItem {
            alarm_id: alarm.id,
            imei: alarm.imei.clone(),
            channel,
            payload: serde_json::to_value(alarm).unwrap_or(serde_json::Value::Null),
            error_message: reason.to_string(),
            error_type: error_type::VALIDATION_ERROR.to_string(),
            attempts: 0,
        };
        if let Err(e) = self.store.insert_dlq_item(item).await {
            warn!(alarm_id = alarm.id, error = %e, "Could not park invalid alarm");
        } else {
            metrics::record_dlq_enqueued(channel.as_str(), error_type::VALIDATION_ERROR);
        }
    }

    /// One channel's delivery task: skip conditions, idempotency check, then
    /// the limiter/breaker/retry loop.
    async fn process_channel(
        &self,
        alarm: &Alarm,
        channel: Channel,
        contacts: &[Contact],
    ) -> ChannelOutcome {
        let adapter = match self.adapters.get(&channel) {
            Some(adapter) => adapter,
            None => return ChannelOutcome::Skipped("no adapter configured".to_string()),
        };

        let recipients: Vec<Recipient> = contacts
            .iter()
            .filter_map(|c| {
                c.recipient_for(channel).map(|address| Recipient {
                    name: c.name.clone(),
                    address: address.to_string(),
                })
            })
            .collect();

        if recipients.is_empty() {
            debug!(alarm_id = alarm.id, channel = %channel, "No recipients, skipping");
            return ChannelOutcome::Skipped("no recipients".to_string());
        }
        if !adapter.is_ready() {
            debug!(alarm_id = alarm.id, channel = %channel, "Adapter not ready, skipping");
            return ChannelOutcome::Skipped("adapter not ready".to_string());
        }

        // Idempotency: one successful send per (alarm_id, channel), ever.
        match self.store.has_successful_attempt(alarm.id, channel).await {
            Ok(true) => {
                debug!(alarm_id = alarm.id, channel = %channel, "Already sent, skipping");
                // Heal the sent flag if a crash left it behind the audit log
                if let Err(e) = self.store.mark_channel_sent(alarm.id, channel).await {
                    warn!(alarm_id = alarm.id, channel = %channel, error = %e, "Sent-flag heal failed");
                }
                return ChannelOutcome::Skipped("already sent".to_string());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(alarm_id = alarm.id, channel = %channel, error = %e, "Idempotency check failed");
                return ChannelOutcome::Failed {
                    error_type: error_type::UNKNOWN_ERROR.to_string(),
                    message: format!("Idempotency check failed: {}", e),
                };
            }
        }

        let breaker = self.breakers.get(channel);
        let limiter = &self.limiters[&channel];
        let policy = &self.retries[&channel];
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if let Err(rejection) = breaker.try_acquire() {
                metrics::record_breaker_rejection(channel.as_str(), rejection.error_type());
                return self
                    .terminal_failure(
                        alarm,
                        channel,
                        &recipients,
                        rejection.error_type(),
                        rejection.to_string(),
                        attempt,
                    )
                    .await;
            }

            let permit = limiter.acquire().await;
            metrics::set_channel_in_flight(channel.as_str(), limiter.in_flight());
            let result = adapter.send(alarm, &recipients).await;
            drop(permit);

            match result {
                Ok(report) => {
                    breaker.record_success();
                    self.record_success(alarm, channel, adapter.provider(), &report)
                        .await;

                    let elapsed = started.elapsed();
                    let within_sla = elapsed <= self.sla[&channel];
                    metrics::record_send_latency(channel.as_str(), elapsed, within_sla);
                    metrics::record_notification(channel.as_str(), true);

                    info!(
                        alarm_id = alarm.id,
                        channel = %channel,
                        attempts = attempt,
                        recipients = report.recipients.len(),
                        "Notification sent"
                    );
                    return ChannelOutcome::Sent;
                }
                Err(e) => {
                    // Permanent rejections are answered requests, not
                    // dependency failures; they do not trip the breaker.
                    if e.retryable {
                        breaker.record_failure();
                    } else {
                        breaker.record_success();
                    }

                    if e.retryable && attempt <= policy.max_retries {
                        let delay = policy.delay_for(attempt, alarm.priority);
                        metrics::record_retry(channel.as_str(), attempt);
                        debug!(
                            alarm_id = alarm.id,
                            channel = %channel,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying after transient send failure"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    metrics::record_notification(channel.as_str(), false);
                    return self
                        .terminal_failure(alarm, channel, &recipients, &e.error_type, e.message, attempt)
                        .await;
                }
            }
        }
    }

    /// Audit per recipient, flip the sent flag, swallow audit-write errors.
    async fn record_success(
        &self,
        alarm: &Alarm,
        channel: Channel,
        provider: &str,
        report: &ChannelSendReport,
    ) {
        let now = Utc::now();
        for recipient in &report.recipients {
            let attempt = NotificationAttempt {
                alarm_id: alarm.id,
                imei: alarm.imei.clone(),
                gps_time: alarm.gps_time,
                channel,
                recipient: recipient.recipient.clone(),
                status: if recipient.success {
                    AttemptStatus::Success
                } else {
                    AttemptStatus::Failed
                },
                error: recipient.error.clone(),
                provider_message_id: recipient.provider_id.clone(),
                provider: if report.provider.is_empty() {
                    provider.to_string()
                } else {
                    report.provider.clone()
                },
                modem_id: recipient.modem_id.or(report.modem_id),
                modem_name: recipient.modem_name.clone().or_else(|| report.modem_name.clone()),
                sent_at: now,
            };
            // A conflict on the success-only uniqueness index (concurrent
            // duplicate) lands here; the send stands either way.
            if let Err(e) = self.store.insert_attempt(&attempt).await {
                warn!(
                    alarm_id = alarm.id,
                    channel = %channel,
                    recipient = %attempt.recipient,
                    error = %e,
                    "Audit write failed after successful send"
                );
            }
        }

        if let Err(e) = self.store.mark_channel_sent(alarm.id, channel).await {
            warn!(alarm_id = alarm.id, channel = %channel, error = %e, "Sent-flag write failed");
        }
    }

    /// Terminal failure: failed audit row plus a DLQ item carrying the
    /// serialized alarm.
    async fn terminal_failure(
        &self,
        alarm: &Alarm,
        channel: Channel,
        recipients: &[Recipient],
        error_type: &str,
        message: String,
        attempts: u32,
    ) -> ChannelOutcome {
        warn!(
            alarm_id = alarm.id,
            channel = %channel,
            error_type = %error_type,
            attempts = attempts,
            "Channel delivery failed terminally"
        );

        let recipient = recipients
            .first()
            .map(|r| r.address.clone())
            .unwrap_or_else(|| "-".to_string());
        let attempt = NotificationAttempt {
            alarm_id: alarm.id,
            imei: alarm.imei.clone(),
            gps_time: alarm.gps_time,
            channel,
            recipient,
            status: AttemptStatus::Failed,
            error: Some(message.clone()),
            provider_message_id: None,
            provider: self
                .adapters
                .get(&channel)
                .map(|a| a.provider().to_string())
                .unwrap_or_default(),
            modem_id: None,
            modem_name: None,
            sent_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_attempt(&attempt).await {
            warn!(alarm_id = alarm.id, channel = %channel, error = %e, "Failure audit write failed");
        }

        let item = NewDlqItem {
            alarm_id: alarm.id,
            imei: alarm.imei.clone(),
            channel,
            payload: serde_json::to_value(alarm).unwrap_or(serde_json::Value::Null),
            error_message: message.clone(),
            error_type: error_type.to_string(),
            attempts: attempts as i32,
        };
        if let Err(e) = self.store.insert_dlq_item(item).await {
            warn!(alarm_id = alarm.id, channel = %channel, error = %e, "DLQ insert failed");
        } else {
            metrics::record_dlq_enqueued(channel.as_str(), error_type);
        }

        ChannelOutcome::Failed {
            error_type: error_type.to_string(),
            message,
        }
    }
}
