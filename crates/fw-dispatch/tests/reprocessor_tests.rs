//! DLQ Reprocessor Integration Tests
//!
//! Replay cycles against the in-memory store:
//! - Batch-size-bounded replay in (attempts asc, age asc) order
//! - Breaker-aware channel filtering
//! - Failed replays leaving the original item untouched
//! - Edge-triggered size alerting

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use fw_channels::{ChannelAdapter, ChannelSendReport, Recipient, RecipientReport, SendError};
use fw_common::{feature_flags, Alarm, Channel, Contact, ContactType};
use fw_config::{ChannelConfig, ChannelsConfig, CircuitBreakerConfig};
use fw_dispatch::{
    AlarmProcessor, DlqReprocessor, DlqReprocessorConfig, ProcessorConfig,
};
use fw_store::{AlarmStore, InMemoryAlarmStore, NewDlqItem};

struct CountingAdapter {
    channel: Channel,
    fail_all: bool,
    send_count: AtomicU32,
}

impl CountingAdapter {
    fn new(channel: Channel, fail_all: bool) -> Arc<Self> {
        Arc::new(Self {
            channel,
            fail_all,
            send_count: AtomicU32::new(0),
        })
    }

    fn sends(&self) -> u32 {
        self.send_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for CountingAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn provider(&self) -> &str {
        "counting"
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn send(
        &self,
        _alarm: &Alarm,
        recipients: &[Recipient],
    ) -> Result<ChannelSendReport, SendError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_all {
            return Err(SendError::permanent("DELIVERY_REJECTED", "scripted failure"));
        }
        Ok(ChannelSendReport {
            success: true,
            provider: "counting".to_string(),
            message_id: None,
            recipients: recipients
                .iter()
                .map(|r| RecipientReport {
                    recipient: r.address.clone(),
                    success: true,
                    provider_id: None,
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

fn contact(imei: &str) -> Contact {
    Contact {
        id: 1,
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

fn sms_payload(alarm_id: i64, imei: &str) -> serde_json::Value {
    serde_json::json!({
        "id": alarm_id,
        "imei": imei,
        "status": "SOS",
        "priority": 7,
        "is_sms": true
    })
}

async fn seed_dlq(store: &Arc<InMemoryAlarmStore>, count: i64) -> Vec<i64> {
    let mut ids = Vec::new();
    for n in 1..=count {
        let id = store
            .insert_dlq_item(NewDlqItem {
                alarm_id: n,
                imei: format!("{}", 100 + n),
                channel: Channel::Sms,
                payload: sms_payload(n, &format!("{}", 100 + n)),
                error_message: "timeout".to_string(),
                error_type: "SMS_SEND_FAILED".to_string(),
                attempts: 1,
            })
            .await
            .unwrap();
        store.add_contact(contact(&format!("{}", 100 + n)));
        ids.push(id);
    }
    ids
}

fn build(
    store: &Arc<InMemoryAlarmStore>,
    adapter: Arc<dyn ChannelAdapter>,
    batch_size: u32,
    alert_threshold: i64,
) -> (Arc<AlarmProcessor>, DlqReprocessor) {
    let channel = ChannelConfig {
        max_concurrency: 10,
        max_retries: 0,
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 50,
        sla_ms: 60_000,
    };
    let processor = Arc::new(AlarmProcessor::new(
        store.clone() as Arc<dyn AlarmStore>,
        vec![adapter],
        ProcessorConfig {
            channels: ChannelsConfig {
                email: channel.clone(),
                sms: channel.clone(),
                voice: channel,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                open_timeout_seconds: 60,
            },
            dedup_window_minutes: 60,
        },
    ));
    let reprocessor = DlqReprocessor::new(
        store.clone() as Arc<dyn AlarmStore>,
        processor.clone(),
        DlqReprocessorConfig {
            interval: Duration::from_secs(300),
            batch_size,
            alert_threshold,
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3_600),
            channel: None,
            error_type: None,
        },
    );
    (processor, reprocessor)
}

#[tokio::test]
async fn cycle_replays_up_to_batch_size_oldest_first() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);
    let ids = seed_dlq(&store, 10).await;

    // Stagger ages so ordering is observable; equal attempts everywhere
    let now = Utc::now();
    for (n, id) in ids.iter().enumerate() {
        store.backdate_dlq_item(*id, now - ChronoDuration::hours(10 - n as i64), 1);
    }

    let adapter = CountingAdapter::new(Channel::Sms, false);
    let (_processor, reprocessor) = build(&store, adapter.clone(), 5, 1_000);

    let stats = reprocessor.run_cycle().await.unwrap();
    assert_eq!(stats.examined, 5);
    assert_eq!(stats.reprocessed, 5);
    assert_eq!(stats.failed, 0);

    // The five oldest items (first seeded) were replayed
    let items = store.dlq_items();
    let replayed: Vec<i64> = items
        .iter()
        .filter(|i| i.reprocessed)
        .map(|i| i.id)
        .collect();
    assert_eq!(replayed, ids[..5].to_vec());

    let remaining: Vec<i64> = items
        .iter()
        .filter(|i| !i.reprocessed)
        .map(|i| i.id)
        .collect();
    assert_eq!(remaining.len(), 5);
}

#[tokio::test]
async fn low_attempt_items_replay_first() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);
    let ids = seed_dlq(&store, 3).await;

    let now = Utc::now();
    store.backdate_dlq_item(ids[0], now - ChronoDuration::hours(5), 4);
    store.backdate_dlq_item(ids[1], now - ChronoDuration::hours(1), 1);
    store.backdate_dlq_item(ids[2], now - ChronoDuration::hours(3), 1);

    let adapter = CountingAdapter::new(Channel::Sms, false);
    let (_processor, reprocessor) = build(&store, adapter, 2, 1_000);

    reprocessor.run_cycle().await.unwrap();

    let items = store.dlq_items();
    // attempts asc, then age asc: ids[2] (1 attempt, older) and ids[1]
    assert!(items.iter().find(|i| i.id == ids[2]).unwrap().reprocessed);
    assert!(items.iter().find(|i| i.id == ids[1]).unwrap().reprocessed);
    assert!(!items.iter().find(|i| i.id == ids[0]).unwrap().reprocessed);
}

#[tokio::test]
async fn open_breaker_skips_channel_items() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);
    seed_dlq(&store, 4).await;

    let adapter = CountingAdapter::new(Channel::Sms, false);
    let (processor, reprocessor) = build(&store, adapter.clone(), 10, 1_000);

    // Trip the SMS breaker
    let breaker = processor.breakers().get(Channel::Sms);
    for _ in 0..3 {
        breaker.record_failure();
    }

    let stats = reprocessor.run_cycle().await.unwrap();
    assert_eq!(stats.reprocessed, 0);
    assert_eq!(adapter.sends(), 0);
    assert!(store.dlq_items().iter().all(|i| !i.reprocessed));

    // Recovery: reset and replay
    breaker.reset();
    let stats = reprocessor.run_cycle().await.unwrap();
    assert_eq!(stats.reprocessed, 4);
}

#[tokio::test]
async fn failed_replay_leaves_original_untouched() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);
    let ids = seed_dlq(&store, 1).await;

    let adapter = CountingAdapter::new(Channel::Sms, true);
    let (_processor, reprocessor) = build(&store, adapter, 10, 1_000);

    let stats = reprocessor.run_cycle().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.reprocessed, 0);

    let items = store.dlq_items();
    let original = items.iter().find(|i| i.id == ids[0]).unwrap();
    assert!(!original.reprocessed);
    assert!(original.reprocessed_at.is_none());

    // The re-failure parked a fresh item; the original is untouched
    assert!(items.len() > 1);
}

#[tokio::test]
async fn malformed_payload_is_skipped() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);

    store
        .insert_dlq_item(NewDlqItem {
            alarm_id: 1,
            imei: "101".to_string(),
            channel: Channel::Sms,
            payload: serde_json::json!({"id": 1}), // missing imei, status
            error_message: "x".to_string(),
            error_type: "SMS_SEND_FAILED".to_string(),
            attempts: 1,
        })
        .await
        .unwrap();

    let adapter = CountingAdapter::new(Channel::Sms, false);
    let (_processor, reprocessor) = build(&store, adapter.clone(), 10, 1_000);

    let stats = reprocessor.run_cycle().await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(adapter.sends(), 0);
}

#[tokio::test]
async fn alert_is_edge_triggered() {
    let store = Arc::new(InMemoryAlarmStore::new());
    store.set_flag(feature_flags::CHANNEL_FALLBACK_ENABLED, true);
    seed_dlq(&store, 3).await;

    let adapter = CountingAdapter::new(Channel::Sms, false);
    let (_processor, reprocessor) = build(&store, adapter, 2, 3);

    assert!(!reprocessor.alert_active());

    // 3 pending >= threshold 3: raised
    reprocessor.run_cycle().await.unwrap();
    assert!(reprocessor.alert_active());

    // 1 pending after the batch of 2: cleared
    reprocessor.run_cycle().await.unwrap();
    assert!(!reprocessor.alert_active());
}
