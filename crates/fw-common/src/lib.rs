use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod logging;

// ============================================================================
// Channels
// ============================================================================

/// Notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Voice,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Voice];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Voice => "voice",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "voice" | "call" => Some(Channel::Voice),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Alarm
// ============================================================================

/// A device-generated alarm event requiring notification dispatch.
///
/// `(imei, gps_time)` identifies the event within the upstream tracking
/// platform; `id` identifies it here. The only mutations this system issues
/// are the per-channel sent flags and the notification audit rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: i64,
    pub imei: String,
    /// Status label, e.g. "SOS", "GEOFENCE_EXIT". Doubles as the alarm type
    /// for deduplication.
    pub status: String,
    #[serde(default)]
    pub category: Option<String>,
    /// 0-10, higher is more urgent. Maps to AMQP message priority.
    #[serde(default = "default_priority")]
    pub priority: u8,

    pub gps_time: Option<DateTime<Utc>>,
    pub server_time: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub angle: Option<f64>,
    pub satellites: Option<i32>,
    pub speed: Option<f64>,

    #[serde(default)]
    pub is_email: bool,
    #[serde(default)]
    pub is_sms: bool,
    #[serde(default)]
    pub is_call: bool,

    #[serde(default)]
    pub email_sent: bool,
    #[serde(default)]
    pub sms_sent: bool,
    #[serde(default)]
    pub call_sent: bool,

    #[serde(default = "default_true")]
    pub is_valid: bool,
    /// Opaque producer state, carried through untouched.
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub distance: Option<f64>,
}

fn default_priority() -> u8 {
    5
}

fn default_true() -> bool {
    true
}

impl Alarm {
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.is_email,
            Channel::Sms => self.is_sms,
            Channel::Voice => self.is_call,
        }
    }

    pub fn channel_sent(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email_sent,
            Channel::Sms => self.sms_sent,
            Channel::Voice => self.call_sent,
        }
    }

    pub fn set_channel_sent(&mut self, channel: Channel) {
        match channel {
            Channel::Email => self.email_sent = true,
            Channel::Sms => self.sms_sent = true,
            Channel::Voice => self.call_sent = true,
        }
    }

    /// Channels enabled on the alarm and not yet marked sent.
    pub fn pending_channels(&self) -> Vec<Channel> {
        Channel::ALL
            .iter()
            .copied()
            .filter(|c| self.channel_enabled(*c) && !self.channel_sent(*c))
            .collect()
    }
}

// ============================================================================
// Contacts & Quiet Hours
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    Primary,
    Secondary,
    Emergency,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Primary => "primary",
            ContactType::Secondary => "secondary",
            ContactType::Emergency => "emergency",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(ContactType::Primary),
            "secondary" => Some(ContactType::Secondary),
            "emergency" => Some(ContactType::Emergency),
            _ => None,
        }
    }
}

/// A daily suppression window. Times are minutes since midnight in the
/// contact's local clock; the UTC offset is resolved when the row is written
/// so evaluation is plain offset arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_minute: u16,
    pub end_minute: u16,
    pub utc_offset_minutes: i32,
}

impl QuietHours {
    /// Whether `now` falls inside the window. Windows may wrap midnight
    /// (e.g. 22:00-06:00).
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let local_minutes = (now.timestamp() / 60 + self.utc_offset_minutes as i64)
            .rem_euclid(24 * 60) as u16;
        if self.start_minute <= self.end_minute {
            local_minutes >= self.start_minute && local_minutes < self.end_minute
        } else {
            local_minutes >= self.start_minute || local_minutes < self.end_minute
        }
    }
}

/// Per-device notification recipient.
///
/// Invariant: at least one of `email` / `phone` is set; inactive contacts are
/// never selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub imei: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub contact_type: ContactType,
    /// Lower is higher priority.
    pub priority: i32,
    pub active: bool,
    pub quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub bounce_count: i32,
    #[serde(default)]
    pub last_bounce_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// The recipient address for a channel, if the contact carries one.
    pub fn recipient_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms | Channel::Voice => self.phone.as_deref(),
        }
    }
}

// ============================================================================
// Deduplication
// ============================================================================

/// Collapses repeated `(imei, alarm_type)` events inside the dedup window to
/// a single notification fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    pub imei: String,
    pub alarm_type: String,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub occurrence_count: i64,
    pub notification_sent: bool,
}

// ============================================================================
// Notification Audit
// ============================================================================

/// Audit status. The uniqueness index on `(alarm_id, channel)` only covers
/// `success` rows, so the two values must never be conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AttemptStatus::Success),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

/// One audit row per recipient per delivery attempt outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationAttempt {
    pub alarm_id: i64,
    pub imei: String,
    pub gps_time: Option<DateTime<Utc>>,
    pub channel: Channel,
    pub recipient: String,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider: String,
    pub modem_id: Option<i64>,
    pub modem_name: Option<String>,
    pub sent_at: DateTime<Utc>,
}

// ============================================================================
// Dead-Letter Queue
// ============================================================================

/// Well-known `error_type` values. Adapters may report transport-specific
/// types beyond these.
pub mod error_type {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
    pub const CIRCUIT_BREAKER_HALF_OPEN_BUSY: &str = "CIRCUIT_BREAKER_HALF_OPEN_BUSY";
    pub const NO_MODEM_AVAILABLE: &str = "NO_MODEM_AVAILABLE";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// A terminally-failed alarm parked for later replay.
///
/// `reprocessed = true` is terminal; a re-failure on replay creates a new
/// item rather than reviving this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: i64,
    pub alarm_id: i64,
    pub imei: String,
    pub channel: Channel,
    /// Serialized alarm as received.
    pub payload: serde_json::Value,
    pub error_message: String,
    pub error_type: String,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub reprocessed: bool,
    pub reprocessed_at: Option<DateTime<Utc>>,
}

/// Aggregate view of the DLQ, read at the start of each reprocess cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqSummary {
    pub total: i64,
    pub by_channel: HashMap<String, i64>,
    pub by_error_type: HashMap<String, i64>,
    pub average_age_seconds: f64,
    pub max_attempts: i32,
}

// ============================================================================
// Modems
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModemHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
    QuotaExhausted,
}

impl ModemHealth {
    /// Only `unhealthy` and `quota_exhausted` are blocked from selection.
    pub fn is_selectable(&self) -> bool {
        !matches!(self, ModemHealth::Unhealthy | ModemHealth::QuotaExhausted)
    }

    /// Sort rank for tier-2/3 ordering: healthy before degraded before
    /// unknown.
    pub fn selection_rank(&self) -> u8 {
        match self {
            ModemHealth::Healthy => 0,
            ModemHealth::Degraded => 1,
            ModemHealth::Unknown => 2,
            ModemHealth::Unhealthy | ModemHealth::QuotaExhausted => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModemHealth::Healthy => "healthy",
            ModemHealth::Degraded => "degraded",
            ModemHealth::Unhealthy => "unhealthy",
            ModemHealth::Unknown => "unknown",
            ModemHealth::QuotaExhausted => "quota_exhausted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "healthy" => ModemHealth::Healthy,
            "degraded" => ModemHealth::Degraded,
            "unhealthy" => ModemHealth::Unhealthy,
            "quota_exhausted" => ModemHealth::QuotaExhausted,
            _ => ModemHealth::Unknown,
        }
    }
}

/// Service scopes a modem is allowed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTag {
    Alarms,
    Commands,
    Otp,
    Marketing,
}

impl ServiceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTag::Alarms => "alarms",
            ServiceTag::Commands => "commands",
            ServiceTag::Otp => "otp",
            ServiceTag::Marketing => "marketing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "alarms" => Some(ServiceTag::Alarms),
            "commands" => Some(ServiceTag::Commands),
            "otp" => Some(ServiceTag::Otp),
            "marketing" => Some(ServiceTag::Marketing),
            _ => None,
        }
    }
}

/// An SMS transport with quota and health tracking.
///
/// Invariant: `sms_sent_count <= sms_limit` for a selectable modem; crossing
/// the limit transitions health to `quota_exhausted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Modem {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Hardware identifier reported by the device itself.
    pub modem_hw_id: Option<String>,
    pub enabled: bool,
    /// Lower is preferred within a tier.
    pub priority: i32,
    pub max_concurrent: u32,
    pub health: ModemHealth,
    pub last_health_check: Option<DateTime<Utc>>,
    pub sms_sent_count: i64,
    pub sms_limit: i64,
    pub package_cost: f64,
    pub package_currency: String,
    pub package_end_date: Option<DateTime<Utc>>,
    pub allowed_services: Vec<ServiceTag>,
}

impl Modem {
    pub fn remaining_quota(&self) -> i64 {
        (self.sms_limit - self.sms_sent_count).max(0)
    }

    pub fn has_quota(&self) -> bool {
        self.sms_sent_count < self.sms_limit
    }

    /// Reported accounting cost of one SMS on this modem.
    pub fn cost_per_sms(&self) -> f64 {
        if self.sms_limit > 0 {
            self.package_cost / self.sms_limit as f64
        } else {
            0.0
        }
    }

    pub fn allows_service(&self, tag: ServiceTag) -> bool {
        self.allowed_services.contains(&tag)
    }
}

/// Which selection tier produced a modem, recorded for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionTier {
    Device,
    Service,
    Fallback,
    Mock,
}

impl SelectionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionTier::Device => "device",
            SelectionTier::Service => "service",
            SelectionTier::Fallback => "fallback",
            SelectionTier::Mock => "mock",
        }
    }
}

// ============================================================================
// System State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemRunState {
    Running,
    Paused,
    Restarting,
}

impl SystemRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemRunState::Running => "running",
            SystemRunState::Paused => "paused",
            SystemRunState::Restarting => "restarting",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paused" => SystemRunState::Paused,
            "restarting" => SystemRunState::Restarting,
            _ => SystemRunState::Running,
        }
    }
}

/// Singleton operational state consulted by the consumer and the adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub state: SystemRunState,
    pub use_mock_sms: bool,
    pub use_mock_email: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub paused_by: Option<String>,
    pub reason: Option<String>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            state: SystemRunState::Running,
            use_mock_sms: false,
            use_mock_email: false,
            paused_at: None,
            paused_by: None,
            reason: None,
        }
    }
}

impl SystemState {
    pub fn is_paused(&self) -> bool {
        self.state == SystemRunState::Paused
    }
}

// ============================================================================
// Worker Registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Stale,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Stale => "stale",
            WorkerStatus::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "stale" => WorkerStatus::Stale,
            "dead" => WorkerStatus::Dead,
            _ => WorkerStatus::Active,
        }
    }
}

/// A registered consumer instance. `id` is `hostname:pid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub hostname: String,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
}

// ============================================================================
// Feature Flags
// ============================================================================

/// Recognized feature flag names. Unknown flags default to false.
pub mod feature_flags {
    /// Governs error surfacing only: all enabled channels are always
    /// attempted; with the flag set, per-channel failures do not propagate
    /// out of alarm processing.
    pub const CHANNEL_FALLBACK_ENABLED: &str = "channel_fallback_enabled";
    pub const EMAIL_ENABLED: &str = "email_enabled";
    pub const SMS_ENABLED: &str = "sms_enabled";
    pub const VOICE_ENABLED: &str = "voice_enabled";
    pub const DEDUPLICATION_ENABLED: &str = "deduplication_enabled";
    pub const QUIET_HOURS_ENABLED: &str = "quiet_hours_enabled";
    pub const WEBHOOKS_ENABLED: &str = "webhooks_enabled";
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FleetWatchError {
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, FleetWatchError>;
