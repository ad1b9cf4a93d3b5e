//! In-Memory Alarm Store
//!
//! A complete `AlarmStore` backed by process memory. Used by the test suites
//! and available for dry-run drills; semantics mirror the Postgres
//! implementation, including DLQ ordering and the success-only idempotency
//! lookup.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::repository::{AlarmStore, NewDlqItem, WorkerCleanup};
use fw_common::{
    Alarm, AttemptStatus, Channel, Contact, DedupRecord, DlqItem, DlqSummary, Modem, ModemHealth,
    NotificationAttempt, QuietHours, SystemState, Worker, WorkerStatus,
};

#[derive(Default)]
struct Inner {
    alarms: HashMap<i64, Alarm>,
    contacts: Vec<Contact>,
    device_quiet_hours: HashMap<String, QuietHours>,
    dedup: HashMap<(String, String), DedupRecord>,
    attempts: Vec<NotificationAttempt>,
    dlq: Vec<DlqItem>,
    next_dlq_id: i64,
    modems: HashMap<i64, Modem>,
    device_modems: HashMap<String, i64>,
    daily_usage: HashMap<(i64, NaiveDate), i64>,
    system_state: SystemState,
    feature_flags: HashMap<String, bool>,
    workers: HashMap<String, Worker>,
}

/// In-memory implementation of `AlarmStore`
pub struct InMemoryAlarmStore {
    inner: Mutex<Inner>,
}

impl InMemoryAlarmStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_dlq_id: 1,
                ..Inner::default()
            }),
        }
    }

    // ------------------------------------------------------------------
    // Seeding and inspection helpers (not part of the trait)
    // ------------------------------------------------------------------

    pub fn insert_alarm(&self, alarm: Alarm) {
        self.inner.lock().alarms.insert(alarm.id, alarm);
    }

    pub fn add_contact(&self, contact: Contact) {
        self.inner.lock().contacts.push(contact);
    }

    pub fn set_device_quiet_hours(&self, imei: &str, quiet_hours: QuietHours) {
        self.inner
            .lock()
            .device_quiet_hours
            .insert(imei.to_string(), quiet_hours);
    }

    pub fn add_modem(&self, modem: Modem) {
        self.inner.lock().modems.insert(modem.id, modem);
    }

    pub fn set_device_modem(&self, imei: &str, modem_id: i64) {
        self.inner
            .lock()
            .device_modems
            .insert(imei.to_string(), modem_id);
    }

    pub fn set_state(&self, state: SystemState) {
        self.inner.lock().system_state = state;
    }

    pub fn set_flag(&self, name: &str, enabled: bool) {
        self.inner.lock().feature_flags.insert(name.to_string(), enabled);
    }

    pub fn attempts(&self) -> Vec<NotificationAttempt> {
        self.inner.lock().attempts.clone()
    }

    pub fn dlq_items(&self) -> Vec<DlqItem> {
        self.inner.lock().dlq.clone()
    }

    pub fn alarm(&self, id: i64) -> Option<Alarm> {
        self.inner.lock().alarms.get(&id).cloned()
    }

    pub fn modem(&self, id: i64) -> Option<Modem> {
        self.inner.lock().modems.get(&id).cloned()
    }

    pub fn dedup_record(&self, imei: &str, alarm_type: &str) -> Option<DedupRecord> {
        self.inner
            .lock()
            .dedup
            .get(&(imei.to_string(), alarm_type.to_string()))
            .cloned()
    }

    pub fn daily_usage(&self, modem_id: i64, day: NaiveDate) -> i64 {
        self.inner
            .lock()
            .daily_usage
            .get(&(modem_id, day))
            .copied()
            .unwrap_or(0)
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.inner.lock().workers.values().cloned().collect()
    }

    /// Backdate an existing DLQ item, for replay-ordering tests.
    pub fn backdate_dlq_item(&self, id: i64, created_at: DateTime<Utc>, attempts: i32) {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.dlq.iter_mut().find(|i| i.id == id) {
            item.created_at = created_at;
            item.attempts = attempts;
        }
    }
}

impl Default for InMemoryAlarmStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlarmStore for InMemoryAlarmStore {
    async fn get_alarm(&self, alarm_id: i64) -> Result<Option<Alarm>> {
        Ok(self.inner.lock().alarms.get(&alarm_id).cloned())
    }

    async fn mark_channel_sent(&self, alarm_id: i64, channel: Channel) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(alarm) = inner.alarms.get_mut(&alarm_id) {
            alarm.set_channel_sent(channel);
        }
        Ok(())
    }

    async fn active_contacts(&self, imei: &str) -> Result<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self
            .inner
            .lock()
            .contacts
            .iter()
            .filter(|c| c.imei == imei && c.active)
            .cloned()
            .collect();
        contacts.sort_by_key(|c| c.priority);
        Ok(contacts)
    }

    async fn device_quiet_hours(&self, imei: &str) -> Result<Option<QuietHours>> {
        Ok(self.inner.lock().device_quiet_hours.get(imei).copied())
    }

    async fn find_dedup(&self, imei: &str, alarm_type: &str) -> Result<Option<DedupRecord>> {
        Ok(self
            .inner
            .lock()
            .dedup
            .get(&(imei.to_string(), alarm_type.to_string()))
            .cloned())
    }

    async fn increment_dedup(
        &self,
        imei: &str,
        alarm_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner
            .dedup
            .get_mut(&(imei.to_string(), alarm_type.to_string()))
        {
            record.occurrence_count += 1;
            record.last_occurrence = now;
        }
        Ok(())
    }

    async fn reset_dedup(&self, imei: &str, alarm_type: &str, now: DateTime<Utc>) -> Result<()> {
        self.inner.lock().dedup.insert(
            (imei.to_string(), alarm_type.to_string()),
            DedupRecord {
                imei: imei.to_string(),
                alarm_type: alarm_type.to_string(),
                first_occurrence: now,
                last_occurrence: now,
                occurrence_count: 1,
                notification_sent: true,
            },
        );
        Ok(())
    }

    async fn has_successful_attempt(&self, alarm_id: i64, channel: Channel) -> Result<bool> {
        Ok(self.inner.lock().attempts.iter().any(|a| {
            a.alarm_id == alarm_id && a.channel == channel && a.status == AttemptStatus::Success
        }))
    }

    async fn insert_attempt(&self, attempt: &NotificationAttempt) -> Result<()> {
        self.inner.lock().attempts.push(attempt.clone());
        Ok(())
    }

    async fn cleanup_attempts(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.attempts.len();
        inner.attempts.retain(|a| a.sent_at >= older_than);
        Ok((before - inner.attempts.len()) as u64)
    }

    async fn insert_dlq_item(&self, item: NewDlqItem) -> Result<i64> {
        let mut inner = self.inner.lock();
        let id = inner.next_dlq_id;
        inner.next_dlq_id += 1;
        inner.dlq.push(DlqItem {
            id,
            alarm_id: item.alarm_id,
            imei: item.imei,
            channel: item.channel,
            payload: item.payload,
            error_message: item.error_message,
            error_type: item.error_type,
            attempts: item.attempts,
            last_attempt_at: Some(Utc::now()),
            created_at: Utc::now(),
            reprocessed: false,
            reprocessed_at: None,
        });
        Ok(id)
    }

    async fn get_dlq_item(&self, id: i64) -> Result<Option<DlqItem>> {
        Ok(self.inner.lock().dlq.iter().find(|i| i.id == id).cloned())
    }

    async fn fetch_dlq_batch(
        &self,
        limit: u32,
        channel: Option<Channel>,
        error_type: Option<&str>,
    ) -> Result<Vec<DlqItem>> {
        let mut items: Vec<DlqItem> = self
            .inner
            .lock()
            .dlq
            .iter()
            .filter(|i| !i.reprocessed)
            .filter(|i| channel.map(|c| i.channel == c).unwrap_or(true))
            .filter(|i| error_type.map(|e| i.error_type == e).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.attempts
                .cmp(&b.attempts)
                .then(a.created_at.cmp(&b.created_at))
        });
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn dlq_summary(&self) -> Result<DlqSummary> {
        let inner = self.inner.lock();
        let pending: Vec<&DlqItem> = inner.dlq.iter().filter(|i| !i.reprocessed).collect();

        let mut by_channel = HashMap::new();
        let mut by_error_type = HashMap::new();
        let mut age_sum = 0.0;
        let mut max_attempts = 0;
        let now = Utc::now();

        for item in &pending {
            *by_channel.entry(item.channel.as_str().to_string()).or_insert(0) += 1;
            *by_error_type.entry(item.error_type.clone()).or_insert(0) += 1;
            age_sum += (now - item.created_at).num_seconds() as f64;
            max_attempts = max_attempts.max(item.attempts);
        }

        Ok(DlqSummary {
            total: pending.len() as i64,
            by_channel,
            by_error_type,
            average_age_seconds: if pending.is_empty() {
                0.0
            } else {
                age_sum / pending.len() as f64
            },
            max_attempts,
        })
    }

    async fn mark_dlq_reprocessed(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.dlq.iter_mut().find(|i| i.id == id) {
            item.reprocessed = true;
            item.reprocessed_at = Some(at);
        }
        Ok(())
    }

    async fn cleanup_dlq(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.dlq.len();
        inner
            .dlq
            .retain(|i| !(i.reprocessed && i.created_at < older_than));
        Ok((before - inner.dlq.len()) as u64)
    }

    async fn list_modems(&self) -> Result<Vec<Modem>> {
        let mut modems: Vec<Modem> = self.inner.lock().modems.values().cloned().collect();
        modems.sort_by_key(|m| (m.priority, m.id));
        Ok(modems)
    }

    async fn device_modem_id(&self, imei: &str) -> Result<Option<i64>> {
        Ok(self.inner.lock().device_modems.get(imei).copied())
    }

    async fn increment_modem_counter(&self, modem_id: i64, day: NaiveDate) -> Result<i64> {
        let mut inner = self.inner.lock();
        *inner.daily_usage.entry((modem_id, day)).or_insert(0) += 1;
        let modem = inner
            .modems
            .get_mut(&modem_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown modem: {}", modem_id))?;
        modem.sms_sent_count += 1;
        Ok(modem.sms_sent_count)
    }

    async fn set_modem_health(
        &self,
        modem_id: i64,
        health: ModemHealth,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(modem) = inner.modems.get_mut(&modem_id) {
            modem.health = health;
            modem.last_health_check = Some(checked_at);
        }
        Ok(())
    }

    async fn reset_modem_package(&self, modem_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(modem) = inner.modems.get_mut(&modem_id) {
            modem.sms_sent_count = 0;
            modem.health = ModemHealth::Healthy;
        }
        Ok(())
    }

    async fn get_system_state(&self) -> Result<SystemState> {
        Ok(self.inner.lock().system_state.clone())
    }

    async fn set_system_state(&self, state: &SystemState) -> Result<()> {
        self.inner.lock().system_state = state.clone();
        Ok(())
    }

    async fn feature_flag(&self, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .feature_flags
            .get(name)
            .copied()
            .unwrap_or(false))
    }

    async fn set_feature_flag(&self, name: &str, enabled: bool) -> Result<()> {
        self.inner
            .lock()
            .feature_flags
            .insert(name.to_string(), enabled);
        Ok(())
    }

    async fn upsert_worker(&self, worker: &Worker) -> Result<()> {
        self.inner
            .lock()
            .workers
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn worker_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = now;
                worker.status = WorkerStatus::Active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cleanup_workers(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
        dead_after_seconds: i64,
    ) -> Result<WorkerCleanup> {
        let stale_cutoff = now - Duration::seconds(stale_after_seconds);
        let dead_cutoff = now - Duration::seconds(dead_after_seconds);
        let removal_cutoff = now - Duration::hours(1);

        let mut result = WorkerCleanup::default();
        let mut inner = self.inner.lock();

        for worker in inner.workers.values_mut() {
            if worker.last_heartbeat < dead_cutoff {
                if worker.status != WorkerStatus::Dead {
                    worker.status = WorkerStatus::Dead;
                    result.marked_dead += 1;
                }
            } else if worker.last_heartbeat < stale_cutoff
                && worker.status == WorkerStatus::Active
            {
                worker.status = WorkerStatus::Stale;
                result.marked_stale += 1;
            }
        }

        let before = inner.workers.len();
        inner
            .workers
            .retain(|_, w| !(w.status == WorkerStatus::Dead && w.last_heartbeat < removal_cutoff));
        result.removed = (before - inner.workers.len()) as u64;

        Ok(result)
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.inner.lock().workers.remove(worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dlq_item(alarm_id: i64) -> NewDlqItem {
        NewDlqItem {
            alarm_id,
            imei: "123".to_string(),
            channel: Channel::Sms,
            payload: serde_json::json!({"id": alarm_id, "imei": "123", "status": "SOS"}),
            error_message: "timeout".to_string(),
            error_type: "UNKNOWN_ERROR".to_string(),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn dlq_batch_orders_by_attempts_then_age() {
        let store = InMemoryAlarmStore::new();
        let a = store.insert_dlq_item(dlq_item(1)).await.unwrap();
        let b = store.insert_dlq_item(dlq_item(2)).await.unwrap();
        let c = store.insert_dlq_item(dlq_item(3)).await.unwrap();

        let now = Utc::now();
        store.backdate_dlq_item(a, now - Duration::hours(1), 3);
        store.backdate_dlq_item(b, now - Duration::hours(2), 1);
        store.backdate_dlq_item(c, now - Duration::hours(3), 1);

        let batch = store.fetch_dlq_batch(10, None, None).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|i| i.id).collect();
        // Low attempts first; within equal attempts, oldest first.
        assert_eq!(ids, vec![c, b, a]);
    }

    #[tokio::test]
    async fn reprocessed_items_leave_the_batch() {
        let store = InMemoryAlarmStore::new();
        let id = store.insert_dlq_item(dlq_item(1)).await.unwrap();
        store.mark_dlq_reprocessed(id, Utc::now()).await.unwrap();

        let batch = store.fetch_dlq_batch(10, None, None).await.unwrap();
        assert!(batch.is_empty());

        let summary = store.dlq_summary().await.unwrap();
        assert_eq!(summary.total, 0);
    }

    #[tokio::test]
    async fn idempotency_lookup_ignores_failed_rows() {
        let store = InMemoryAlarmStore::new();
        store
            .insert_attempt(&NotificationAttempt {
                alarm_id: 1,
                imei: "123".to_string(),
                gps_time: None,
                channel: Channel::Email,
                recipient: "ops@example.com".to_string(),
                status: AttemptStatus::Failed,
                error: Some("rejected".to_string()),
                provider_message_id: None,
                provider: "smtp".to_string(),
                modem_id: None,
                modem_name: None,
                sent_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(!store
            .has_successful_attempt(1, Channel::Email)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn worker_cleanup_transitions() {
        let store = InMemoryAlarmStore::new();
        let now = Utc::now();
        store
            .upsert_worker(&Worker {
                id: "host:1".to_string(),
                hostname: "host".to_string(),
                pid: 1,
                started_at: now - Duration::minutes(10),
                last_heartbeat: now - Duration::seconds(120),
                status: WorkerStatus::Active,
            })
            .await
            .unwrap();

        let cleanup = store.cleanup_workers(now, 90, 300).await.unwrap();
        assert_eq!(cleanup.marked_stale, 1);
        assert_eq!(cleanup.marked_dead, 0);

        let cleanup = store
            .cleanup_workers(now + Duration::seconds(300), 90, 300)
            .await
            .unwrap();
        assert_eq!(cleanup.marked_dead, 1);
    }
}
