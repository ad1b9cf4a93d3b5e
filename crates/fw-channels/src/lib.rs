//! FleetWatch Notification Channels
//!
//! Provides:
//! - The `ChannelAdapter` contract shared by email / SMS / voice
//! - SMTP email adapter (lettre) with a mock fallback
//! - Voice provider adapter (HTTP) with a mock fallback
//! - The SMS modem pool with multi-tier selection, quota accounting, and
//!   health checks

mod adapter;
mod email;
mod modem_pool;
mod sms;
mod voice;

pub use adapter::{
    ChannelAdapter, ChannelSendReport, MockModeProvider, Recipient, RecipientReport, SendError,
    StaticMockMode,
};
pub use email::EmailAdapter;
pub use modem_pool::{
    FleetCostSummary, HttpModemTransport, ModemPool, ModemStats, ModemTransport, SmsSendResult,
    TransportError,
};
pub use sms::SmsAdapter;
pub use voice::VoiceAdapter;
