//! Alarm Processor Integration Tests
//!
//! Exercises the full per-alarm pipeline against the in-memory store with
//! scriptable channel adapters:
//! - Happy path fan-out and audit rows
//! - Dedup window, quiet hours, validation parking
//! - Idempotency across repeated invocations
//! - Circuit breaker opening and channel isolation
//! - Bounded per-channel concurrency
//! - Fallback flag governing error propagation only

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;

use fw_channels::{ChannelAdapter, ChannelSendReport, Recipient, RecipientReport, SendError};
use fw_common::{
    error_type, feature_flags, Alarm, AttemptStatus, Channel, Contact, ContactType, QuietHours,
};
use fw_config::{ChannelConfig, ChannelsConfig, CircuitBreakerConfig};
use fw_dispatch::{AlarmProcessor, ChannelOutcome, ProcessOutcome, ProcessorConfig};
use fw_store::{AlarmStore, InMemoryAlarmStore};

/// Adapter that fails a scripted number of sends, then succeeds.
struct ScriptedAdapter {
    channel: Channel,
    remaining_failures: AtomicU32,
    retryable: bool,
    send_count: AtomicU32,
    concurrent: AtomicU32,
    peak_concurrent: AtomicU32,
    delay: Duration,
}

impl ScriptedAdapter {
    fn ok(channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            remaining_failures: AtomicU32::new(0),
            retryable: true,
            send_count: AtomicU32::new(0),
            concurrent: AtomicU32::new(0),
            peak_concurrent: AtomicU32::new(0),
            delay: Duration::ZERO,
        })
    }

    fn failing(channel: Channel, failures: u32, retryable: bool) -> Arc<Self> {
        Arc::new(Self {
            channel,
            remaining_failures: AtomicU32::new(failures),
            retryable,
            send_count: AtomicU32::new(0),
            concurrent: AtomicU32::new(0),
            peak_concurrent: AtomicU32::new(0),
            delay: Duration::ZERO,
        })
    }

    fn slow(channel: Channel, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            channel,
            remaining_failures: AtomicU32::new(0),
            retryable: true,
            send_count: AtomicU32::new(0),
            concurrent: AtomicU32::new(0),
            peak_concurrent: AtomicU32::new(0),
            delay,
        })
    }

    fn sends(&self) -> u32 {
        self.send_count.load(Ordering::SeqCst)
    }

    fn peak(&self) -> u32 {
        self.peak_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn provider(&self) -> &str {
        "scripted"
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn send(
        &self,
        _alarm: &Alarm,
        recipients: &[Recipient],
    ) -> Result<ChannelSendReport, SendError> {
        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.send_count.fetch_add(1, Ordering::SeqCst);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        let scripted_failure = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(if self.retryable {
                SendError::retryable("TRANSPORT_ERROR", "scripted transient failure")
            } else {
                SendError::permanent("DELIVERY_REJECTED", "scripted permanent failure")
            });
        }

        Ok(ChannelSendReport {
            success: true,
            provider: "scripted".to_string(),
            message_id: Some("msg-1".to_string()),
            recipients: recipients
                .iter()
                .map(|r| RecipientReport {
                    recipient: r.address.clone(),
                    success: true,
                    provider_id: Some("msg-1".to_string()),
                    modem_id: None,
                    modem_name: None,
                    error: None,
                })
                .collect(),
            modem_id: None,
            modem_name: None,
            tier: None,
        })
    }
}

fn alarm(id: i64, imei: &str, status: &str, priority: u8) -> Alarm {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "imei": imei,
        "status": status,
        "priority": priority,
        "is_email": true,
        "is_sms": true
    }))
    .unwrap()
}

fn contact(id: i64, imei: &str) -> Contact {
    Contact {
        id,
        imei: imei.to_string(),
        name: "Ops".to_string(),
        email: Some("ops@example.com".to_string()),
        phone: Some("+4917012345".to_string()),
        contact_type: ContactType::Primary,
        priority: 0,
        active: true,
        quiet_hours: None,
        bounce_count: 0,
        last_bounce_at: None,
    }
}

fn processor_config(max_retries: u32, failure_threshold: u32) -> ProcessorConfig {
    let channel = ChannelConfig {
        max_concurrency: 10,
        max_retries,
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 50,
        sla_ms: 60_000,
    };
    ProcessorConfig {
        channels: ChannelsConfig {
            email: channel.clone(),
            sms: channel.clone(),
            voice: channel,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 2,
            open_timeout_seconds: 60,
        },
        dedup_window_minutes: 60,
    }
}

fn build(
    store: &Arc<InMemoryAlarmStore>,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    config: ProcessorConfig,
) -> AlarmProcessor {
    AlarmProcessor::new(store.clone() as Arc<dyn fw_store::AlarmStore>, adapters, config)
}

#[tokio::test]
async fn happy_path_fans_out_to_enabled_channels() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::ok(Channel::Email);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(
        &store,
        vec![email.clone(), sms.clone()],
        processor_config(3, 5),
    );

    let report = processor
        .process_alarm(alarm(1, "100", "SOS", 9))
        .await
        .unwrap();

    assert_eq!(report.outcome, ProcessOutcome::Processed);
    assert!(report
        .channels
        .iter()
        .all(|(_, outcome)| *outcome == ChannelOutcome::Sent));

    let attempts = store.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Success));

    let stored = store.alarm(1).unwrap();
    assert!(stored.email_sent);
    assert!(stored.sms_sent);
    assert!(!stored.call_sent);
    assert!(store.dlq_items().is_empty());
}

#[tokio::test]
async fn dedup_window_suppresses_second_fanout() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));
    store.set_flag(feature_flags::DEDUPLICATION_ENABLED, true);
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::ok(Channel::Email);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(
        &store,
        vec![email.clone(), sms.clone()],
        processor_config(3, 5),
    );

    processor
        .process_alarm(alarm(1, "100", "SOS", 9))
        .await
        .unwrap();
    let audit_after_first = store.attempts().len();

    // Same (imei, alarm_type) 30 seconds later, well inside W = 60 min
    let report = processor
        .process_alarm(alarm(2, "100", "SOS", 9))
        .await
        .unwrap();

    assert_eq!(report.outcome, ProcessOutcome::DuplicateSuppressed);
    assert_eq!(store.attempts().len(), audit_after_first);

    let record = store.dedup_record("100", "SOS").unwrap();
    assert_eq!(record.occurrence_count, 2);
}

#[tokio::test]
async fn new_fanout_after_window_expires() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));
    store.set_flag(feature_flags::DEDUPLICATION_ENABLED, true);
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::ok(Channel::Email);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(&store, vec![email, sms], processor_config(3, 5));

    processor
        .process_alarm(alarm(1, "100", "SOS", 9))
        .await
        .unwrap();

    // Age the record past the window
    let stale = Utc::now() - chrono::Duration::minutes(61);
    store
        .reset_dedup("100", "SOS", stale)
        .await
        .unwrap();

    let report = processor
        .process_alarm(alarm(2, "100", "SOS", 9))
        .await
        .unwrap();
    assert_eq!(report.outcome, ProcessOutcome::Processed);
    let record = store.dedup_record("100", "SOS").unwrap();
    assert_eq!(record.occurrence_count, 1);
}

#[tokio::test]
async fn quiet_hours_skip_silently() {
    let store = Arc::new(InMemoryAlarmStore::new());
    let mut c = contact(1, "100");
    // Always-active window: full day
    c.quiet_hours = Some(QuietHours {
        start_minute: 0,
        end_minute: 24 * 60,
        utc_offset_minutes: 0,
    });
    store.add_contact(c);
    store.set_flag(feature_flags::QUIET_HOURS_ENABLED, true);

    let email = ScriptedAdapter::ok(Channel::Email);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(
        &store,
        vec![email.clone(), sms.clone()],
        processor_config(3, 5),
    );

    let report = processor
        .process_alarm(alarm(1, "100", "SOS", 9))
        .await
        .unwrap();

    assert_eq!(report.outcome, ProcessOutcome::QuietHours);
    assert_eq!(email.sends(), 0);
    assert_eq!(sms.sends(), 0);
    assert!(store.attempts().is_empty());
    assert!(store.dlq_items().is_empty());
}

#[tokio::test]
async fn invalid_alarm_parks_in_dlq_without_rethrow() {
    let store = Arc::new(InMemoryAlarmStore::new());
    let processor = build(
        &store,
        vec![ScriptedAdapter::ok(Channel::Email)],
        processor_config(3, 5),
    );

    let mut bad = alarm(1, "100", "SOS", 5);
    bad.imei = String::new();

    let report = processor.process_alarm(bad).await.unwrap();
    assert_eq!(report.outcome, ProcessOutcome::Invalid);

    let dlq = store.dlq_items();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].error_type, error_type::VALIDATION_ERROR);
    assert_eq!(dlq[0].attempts, 0);
}

#[tokio::test]
async fn invalid_alarm_with_no_channels_parks_under_email() {
    let store = Arc::new(InMemoryAlarmStore::new());
    let processor = build(
        &store,
        vec![ScriptedAdapter::ok(Channel::Email)],
        processor_config(3, 5),
    );

    // Structurally invalid and no channel enabled: the DLQ row still needs
    // a channel, and email is the documented default.
    let mut bad = alarm(2, "100", "SOS", 5);
    bad.imei = String::new();
    bad.is_email = false;
    bad.is_sms = false;
    bad.is_call = false;

    let report = processor.process_alarm(bad).await.unwrap();
    assert_eq!(report.outcome, ProcessOutcome::Invalid);

    let dlq = store.dlq_items();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].channel, Channel::Email);
    assert_eq!(dlq[0].error_type, error_type::VALIDATION_ERROR);
    assert_eq!(dlq[0].attempts, 0);
}

#[tokio::test]
async fn idempotent_across_repeated_invocations() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::ok(Channel::Email);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(
        &store,
        vec![email.clone(), sms.clone()],
        processor_config(3, 5),
    );

    for _ in 0..3 {
        processor
            .process_alarm(alarm(1, "100", "SOS", 9))
            .await
            .unwrap();
    }

    // One successful audit row per channel, one transport send per channel
    let successes: Vec<_> = store
        .attempts()
        .into_iter()
        .filter(|a| a.status == AttemptStatus::Success)
        .collect();
    assert_eq!(successes.len(), 2);
    assert_eq!(email.sends(), 1);
    assert_eq!(sms.sends(), 1);
}

#[tokio::test]
async fn breaker_opens_and_isolates_channels() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    // Email always fails; one attempt per alarm (no retries); F = 3
    let email = ScriptedAdapter::failing(Channel::Email, u32::MAX, true);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(
        &store,
        vec![email.clone(), sms.clone()],
        processor_config(0, 3),
    );

    for id in 1..=3 {
        let mut a = alarm(id, "100", &format!("SOS{}", id), 9);
        a.is_sms = false;
        processor.process_alarm(a).await.unwrap();
    }
    assert!(!processor.breakers().is_closed(Channel::Email));
    assert_eq!(email.sends(), 3);

    // Fourth alarm: email rejected immediately, SMS still succeeds
    let report = processor
        .process_alarm(alarm(4, "100", "SOS4", 9))
        .await
        .unwrap();

    let email_outcome = report
        .channels
        .iter()
        .find(|(c, _)| *c == Channel::Email)
        .map(|(_, o)| o.clone())
        .unwrap();
    assert!(matches!(
        email_outcome,
        ChannelOutcome::Failed { ref error_type, .. }
            if error_type == fw_common::error_type::CIRCUIT_BREAKER_OPEN
    ));
    let sms_outcome = report
        .channels
        .iter()
        .find(|(c, _)| *c == Channel::Sms)
        .map(|(_, o)| o.clone())
        .unwrap();
    assert_eq!(sms_outcome, ChannelOutcome::Sent);

    // No further transport call on the open channel
    assert_eq!(email.sends(), 3);

    let breaker_items: Vec<_> = store
        .dlq_items()
        .into_iter()
        .filter(|i| i.error_type == error_type::CIRCUIT_BREAKER_OPEN)
        .collect();
    assert_eq!(breaker_items.len(), 1);
    assert_eq!(breaker_items[0].channel, Channel::Email);
    assert_eq!(breaker_items[0].attempts, 1);

    assert!(store.alarm(4).unwrap().sms_sent);
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::failing(Channel::Email, 2, true);
    let processor = build(&store, vec![email.clone()], processor_config(3, 10));

    let mut a = alarm(1, "100", "SOS", 5);
    a.is_sms = false;

    let report = processor.process_alarm(a).await.unwrap();
    assert_eq!(report.channels[0].1, ChannelOutcome::Sent);
    assert_eq!(email.sends(), 3); // 2 failures + 1 success
    assert!(store.dlq_items().is_empty());
}

#[tokio::test]
async fn permanent_failure_short_circuits_retries() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::failing(Channel::Email, u32::MAX, false);
    let processor = build(&store, vec![email.clone()], processor_config(5, 10));

    let mut a = alarm(1, "100", "SOS", 5);
    a.is_sms = false;

    processor.process_alarm(a).await.unwrap();

    // One attempt, no retries for permanent rejections
    assert_eq!(email.sends(), 1);
    let dlq = store.dlq_items();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].error_type, "DELIVERY_REJECTED");
    assert_eq!(dlq[0].attempts, 1);

    let failures: Vec<_> = store
        .attempts()
        .into_iter()
        .filter(|x| x.status == AttemptStatus::Failed)
        .collect();
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn concurrency_is_bounded_per_channel() {
    let store = Arc::new(InMemoryAlarmStore::new());
    for imei in 0..8 {
        store.add_contact(contact(imei, &imei.to_string()));
    }
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::slow(Channel::Email, Duration::from_millis(25));
    let mut config = processor_config(0, 100);
    config.channels.email.max_concurrency = 2;
    let processor = Arc::new(build(&store, vec![email.clone()], config));

    let mut handles = Vec::new();
    for imei in 0..8i64 {
        let processor = processor.clone();
        let mut a = alarm(100 + imei, &imei.to_string(), "SOS", 5);
        a.is_sms = false;
        handles.push(tokio::spawn(async move { processor.process_alarm(a).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(email.sends(), 8);
    assert!(email.peak() <= 2, "peak = {}", email.peak());
}

#[tokio::test]
async fn fallback_flag_governs_error_propagation_only() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.add_contact(contact(1, "100"));

    // Flag off: terminal channel failures surface as Err
    let email = ScriptedAdapter::failing(Channel::Email, u32::MAX, false);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(
        &store,
        vec![email.clone(), sms.clone()],
        processor_config(0, 100),
    );

    let result = processor.process_alarm(alarm(1, "100", "SOS", 5)).await;
    assert!(result.is_err());

    // Both channels were still attempted: failure surfacing, not selection
    assert_eq!(email.sends(), 1);
    assert_eq!(sms.sends(), 1);
    assert!(store.alarm(1).unwrap().sms_sent);
}

#[tokio::test]
async fn no_recipients_skips_channel() {
    let store = Arc::new(InMemoryAlarmStore::new());
    let mut c = contact(1, "100");
    c.email = None; // phone only
    store.add_contact(c);
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    let email = ScriptedAdapter::ok(Channel::Email);
    let sms = ScriptedAdapter::ok(Channel::Sms);
    let processor = build(
        &store,
        vec![email.clone(), sms.clone()],
        processor_config(3, 5),
    );

    let report = processor
        .process_alarm(alarm(1, "100", "SOS", 5))
        .await
        .unwrap();

    let email_outcome = report
        .channels
        .iter()
        .find(|(c, _)| *c == Channel::Email)
        .map(|(_, o)| o.clone())
        .unwrap();
    assert!(matches!(email_outcome, ChannelOutcome::Skipped(_)));
    assert_eq!(email.sends(), 0);
    assert_eq!(sms.sends(), 1);
}
