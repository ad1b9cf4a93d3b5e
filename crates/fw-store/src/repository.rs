//! Alarm Store Trait
//!
//! Defines the persistence interface the notification engine requires from
//! its database. Everything here is owned by the database and shared by
//! reference among components; process-local state (breakers, in-flight
//! counters) never crosses this boundary.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fw_common::{
    Alarm, Channel, Contact, DedupRecord, DlqItem, DlqSummary, Modem, ModemHealth,
    NotificationAttempt, QuietHours, SystemState, Worker,
};

/// Fields for a new dead-letter item. `id`, `created_at`, and the
/// reprocessing columns are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewDlqItem {
    pub alarm_id: i64,
    pub imei: String,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub error_type: String,
    pub attempts: i32,
}

/// Outcome of a worker-registry cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCleanup {
    pub marked_stale: u64,
    pub marked_dead: u64,
    pub removed: u64,
}

#[async_trait]
pub trait AlarmStore: Send + Sync {
    // ========================================================================
    // Alarms
    // ========================================================================

    async fn get_alarm(&self, alarm_id: i64) -> Result<Option<Alarm>>;

    /// Flip a channel-sent flag. Flags only ever go false -> true.
    async fn mark_channel_sent(&self, alarm_id: i64, channel: Channel) -> Result<()>;

    // ========================================================================
    // Contacts & Quiet Hours
    // ========================================================================

    /// Active contacts for a device, ordered by priority (lower first).
    async fn active_contacts(&self, imei: &str) -> Result<Vec<Contact>>;

    /// Device-level quiet-hours rule, if any.
    async fn device_quiet_hours(&self, imei: &str) -> Result<Option<QuietHours>>;

    // ========================================================================
    // Deduplication
    // ========================================================================

    async fn find_dedup(&self, imei: &str, alarm_type: &str) -> Result<Option<DedupRecord>>;

    /// Bump the counter on an existing record inside the window.
    async fn increment_dedup(&self, imei: &str, alarm_type: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// Start a fresh window: insert or reset the record with count 1.
    async fn reset_dedup(&self, imei: &str, alarm_type: &str, now: DateTime<Utc>) -> Result<()>;

    // ========================================================================
    // Notification Audit
    // ========================================================================

    /// Whether a successful audit row exists for `(alarm_id, channel)` -
    /// the idempotency key.
    async fn has_successful_attempt(&self, alarm_id: i64, channel: Channel) -> Result<bool>;

    async fn insert_attempt(&self, attempt: &NotificationAttempt) -> Result<()>;

    /// Delete audit rows older than the cutoff. Returns rows removed.
    async fn cleanup_attempts(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ========================================================================
    // Dead-Letter Queue
    // ========================================================================

    async fn insert_dlq_item(&self, item: NewDlqItem) -> Result<i64>;

    async fn get_dlq_item(&self, id: i64) -> Result<Option<DlqItem>>;

    /// Pending items (not reprocessed), optionally filtered, ordered by
    /// `(attempts asc, created_at asc)` so oldest low-attempt items go first.
    async fn fetch_dlq_batch(
        &self,
        limit: u32,
        channel: Option<Channel>,
        error_type: Option<&str>,
    ) -> Result<Vec<DlqItem>>;

    async fn dlq_summary(&self) -> Result<DlqSummary>;

    /// Mark an item terminal. Re-failures create new items.
    async fn mark_dlq_reprocessed(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Delete reprocessed items older than the cutoff. Returns rows removed.
    async fn cleanup_dlq(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ========================================================================
    // Modems
    // ========================================================================

    async fn list_modems(&self) -> Result<Vec<Modem>>;

    /// Device-specific modem mapping for tier-1 selection.
    async fn device_modem_id(&self, imei: &str) -> Result<Option<i64>>;

    /// Atomically increment the lifetime counter and the per-day usage row.
    /// Returns the new lifetime count.
    async fn increment_modem_counter(&self, modem_id: i64, day: NaiveDate) -> Result<i64>;

    async fn set_modem_health(
        &self,
        modem_id: i64,
        health: ModemHealth,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Package renewal: zero the counter and restore health.
    async fn reset_modem_package(&self, modem_id: i64) -> Result<()>;

    // ========================================================================
    // System State
    // ========================================================================

    async fn get_system_state(&self) -> Result<SystemState>;

    async fn set_system_state(&self, state: &SystemState) -> Result<()>;

    // ========================================================================
    // Feature Flags
    // ========================================================================

    /// Unknown flags read as false.
    async fn feature_flag(&self, name: &str) -> Result<bool>;

    async fn set_feature_flag(&self, name: &str, enabled: bool) -> Result<()>;

    // ========================================================================
    // Worker Registry
    // ========================================================================

    async fn upsert_worker(&self, worker: &Worker) -> Result<()>;

    /// Refresh `last_heartbeat`. Returns false if the row no longer exists
    /// (the worker must re-register).
    async fn worker_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Mark rows stale/dead by heartbeat age and remove dead rows older than
    /// an hour.
    async fn cleanup_workers(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
        dead_after_seconds: i64,
    ) -> Result<WorkerCleanup>;

    async fn remove_worker(&self, worker_id: &str) -> Result<()>;
}
