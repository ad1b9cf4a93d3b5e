//! Channel Adapter Contract
//!
//! A uniform send interface over the three notification transports. Adapters
//! must be safe under concurrent callers up to the channel's configured
//! concurrency; the dispatcher enforces the bound, the adapter only promises
//! thread safety.

use async_trait::async_trait;
use fw_common::{Alarm, Channel, SelectionTier};

/// A projected recipient for one channel (email address or phone number).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub address: String,
}

/// Per-recipient outcome inside a send report.
#[derive(Debug, Clone)]
pub struct RecipientReport {
    pub recipient: String,
    pub success: bool,
    pub provider_id: Option<String>,
    pub modem_id: Option<i64>,
    pub modem_name: Option<String>,
    pub error: Option<String>,
}

/// Result of a channel send. `success` means at least one recipient was
/// delivered; per-recipient details carry the rest.
#[derive(Debug, Clone)]
pub struct ChannelSendReport {
    pub success: bool,
    pub provider: String,
    pub message_id: Option<String>,
    pub recipients: Vec<RecipientReport>,
    pub modem_id: Option<i64>,
    pub modem_name: Option<String>,
    pub tier: Option<SelectionTier>,
}

/// A failed channel send. `retryable` drives the dispatcher's retry loop;
/// `error_type` lands in the audit row and the DLQ item.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct SendError {
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
}

impl SendError {
    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Uniform send contract over email / SMS / voice.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Provider label recorded in the audit log (e.g. "smtp", "modem-pool").
    fn provider(&self) -> &str;

    /// Whether the underlying transport is initialized.
    fn is_ready(&self) -> bool;

    async fn send(
        &self,
        alarm: &Alarm,
        recipients: &[Recipient],
    ) -> Result<ChannelSendReport, SendError>;
}

/// Mock-mode selection, consulted per send. Implemented by the system-state
/// gate; adapters never read the database directly.
pub trait MockModeProvider: Send + Sync {
    fn use_mock_sms(&self) -> bool;
    fn use_mock_email(&self) -> bool;
}

/// Fixed mock-mode answers, for tests and single-shot tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMockMode {
    pub mock_sms: bool,
    pub mock_email: bool,
}

impl MockModeProvider for StaticMockMode {
    fn use_mock_sms(&self) -> bool {
        self.mock_sms
    }

    fn use_mock_email(&self) -> bool {
        self.mock_email
    }
}

/// Short human-readable alarm summary used by the SMS and voice transports.
pub(crate) fn format_alarm_text(alarm: &Alarm) -> String {
    let mut text = format!("FleetWatch alarm {} on device {}", alarm.status, alarm.imei);
    if let (Some(lat), Some(lon)) = (alarm.latitude, alarm.longitude) {
        text.push_str(&format!(" at {:.5},{:.5}", lat, lon));
    }
    if let Some(speed) = alarm.speed {
        text.push_str(&format!(" ({:.0} km/h)", speed));
    }
    text
}
