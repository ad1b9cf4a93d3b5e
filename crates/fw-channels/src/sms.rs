//! SMS Channel Adapter
//!
//! Delegates per-recipient sends to the modem pool; mock mode reroutes the
//! pool to its mock endpoint.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapter::{
    format_alarm_text, ChannelAdapter, ChannelSendReport, MockModeProvider, Recipient,
    RecipientReport, SendError,
};
use crate::modem_pool::ModemPool;
use fw_common::{error_type, Alarm, Channel, ServiceTag};

pub struct SmsAdapter {
    pool: Arc<ModemPool>,
    mock_mode: Arc<dyn MockModeProvider>,
}

impl SmsAdapter {
    pub fn new(pool: Arc<ModemPool>, mock_mode: Arc<dyn MockModeProvider>) -> Self {
        Self { pool, mock_mode }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn provider(&self) -> &str {
        "modem-pool"
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn send(
        &self,
        alarm: &Alarm,
        recipients: &[Recipient],
    ) -> Result<ChannelSendReport, SendError> {
        let mock = self.mock_mode.use_mock_sms();
        let text = format_alarm_text(alarm);

        let mut reports = Vec::with_capacity(recipients.len());
        let mut last_error: Option<SendError> = None;
        let mut modem_id = None;
        let mut modem_name = None;
        let mut tier = None;

        for recipient in recipients {
            match self
                .pool
                .send(&alarm.imei, &recipient.address, &text, ServiceTag::Alarms, mock)
                .await
            {
                Ok(result) => {
                    debug!(
                        alarm_id = alarm.id,
                        recipient = %recipient.address,
                        modem_id = result.modem_id,
                        tier = result.tier.as_str(),
                        "SMS delivered"
                    );
                    modem_id.get_or_insert(result.modem_id);
                    modem_name.get_or_insert(result.modem_name.clone());
                    tier.get_or_insert(result.tier);
                    reports.push(RecipientReport {
                        recipient: recipient.address.clone(),
                        success: true,
                        provider_id: Some(result.provider_message_id),
                        modem_id: Some(result.modem_id),
                        modem_name: Some(result.modem_name),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(
                        alarm_id = alarm.id,
                        recipient = %recipient.address,
                        error = %e,
                        "SMS send failed"
                    );
                    reports.push(RecipientReport {
                        recipient: recipient.address.clone(),
                        success: false,
                        provider_id: None,
                        modem_id: None,
                        modem_name: None,
                        error: Some(e.message.clone()),
                    });
                    last_error = Some(if e.retryable {
                        SendError::retryable("SMS_SEND_FAILED", e.message)
                    } else {
                        SendError::permanent(error_type::NO_MODEM_AVAILABLE, e.message)
                    });
                }
            }
        }

        let any_success = reports.iter().any(|r| r.success);
        if !any_success {
            if let Some(error) = last_error {
                return Err(error);
            }
        }

        Ok(ChannelSendReport {
            success: any_success,
            provider: self.provider().to_string(),
            message_id: reports.iter().find_map(|r| r.provider_id.clone()),
            recipients: reports,
            modem_id,
            modem_name,
            tier,
        })
    }
}
