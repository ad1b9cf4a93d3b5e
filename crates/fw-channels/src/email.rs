//! Email Channel Adapter (SMTP via lettre)

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::{
    ChannelAdapter, ChannelSendReport, MockModeProvider, Recipient, RecipientReport, SendError,
};
use fw_common::{Alarm, Channel};
use fw_config::SmtpConfig;

pub struct EmailAdapter {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    config: SmtpConfig,
    mock_mode: Arc<dyn MockModeProvider>,
}

impl EmailAdapter {
    pub fn new(config: SmtpConfig, mock_mode: Arc<dyn MockModeProvider>) -> Self {
        let transport = match Self::build_transport(&config) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(error = %e, host = %config.host, "SMTP transport unavailable");
                None
            }
        };
        Self {
            transport,
            config,
            mock_mode,
        }
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_seconds)));

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(builder.build())
    }

    fn from_mailbox(&self) -> Result<Mailbox, SendError> {
        format!("{} <{}>", self.config.from_name, self.config.from_address)
            .parse()
            .map_err(|e| {
                SendError::permanent("SMTP_CONFIG", format!("Invalid from address: {}", e))
            })
    }

    fn subject(alarm: &Alarm) -> String {
        format!("FleetWatch alarm: {} ({})", alarm.status, alarm.imei)
    }

    fn body(alarm: &Alarm) -> String {
        let mut body = format!(
            "Alarm {} was raised for device {}.\n\nPriority: {}\n",
            alarm.status, alarm.imei, alarm.priority
        );
        if let Some(gps_time) = alarm.gps_time {
            body.push_str(&format!("Event time: {}\n", gps_time.to_rfc3339()));
        }
        if let (Some(lat), Some(lon)) = (alarm.latitude, alarm.longitude) {
            body.push_str(&format!("Position: {:.6}, {:.6}\n", lat, lon));
        }
        if let Some(speed) = alarm.speed {
            body.push_str(&format!("Speed: {:.0} km/h\n", speed));
        }
        if let Some(category) = &alarm.category {
            body.push_str(&format!("Category: {}\n", category));
        }
        body
    }

    fn classify(e: &lettre::transport::smtp::Error) -> SendError {
        if e.is_permanent() {
            SendError::permanent("SMTP_REJECTED", e.to_string())
        } else if e.is_transient() {
            SendError::retryable("SMTP_TRANSIENT", e.to_string())
        } else {
            SendError::retryable("SMTP_ERROR", e.to_string())
        }
    }

    async fn send_mock(&self, alarm: &Alarm, recipients: &[Recipient]) -> ChannelSendReport {
        let message_id = format!("mock-email-{}", Utc::now().timestamp_millis());
        for recipient in recipients {
            info!(
                alarm_id = alarm.id,
                recipient = %recipient.address,
                "Mock email send"
            );
        }
        ChannelSendReport {
            success: true,
            provider: "mock-email".to_string(),
            message_id: Some(message_id.clone()),
            recipients: recipients
                .iter()
                .map(|r| RecipientReport {
                    recipient: r.address.clone(),
                    success: true,
                    provider_id: Some(message_id.clone()),
                    modem_id: None,
                    modem_name: None,
                    error: None,
                })
                .collect(),
            modem_id: None,
            modem_name: None,
            tier: None,
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn provider(&self) -> &str {
        "smtp"
    }

    fn is_ready(&self) -> bool {
        self.transport.is_some() || self.mock_mode.use_mock_email()
    }

    async fn send(
        &self,
        alarm: &Alarm,
        recipients: &[Recipient],
    ) -> Result<ChannelSendReport, SendError> {
        if self.mock_mode.use_mock_email() {
            return Ok(self.send_mock(alarm, recipients).await);
        }

        let transport = self.transport.as_ref().ok_or_else(|| {
            SendError::retryable("SMTP_NOT_READY", "SMTP transport not initialized")
        })?;

        let from = self.from_mailbox()?;
        let subject = Self::subject(alarm);
        let body = Self::body(alarm);

        let mut reports = Vec::with_capacity(recipients.len());
        let mut last_error: Option<SendError> = None;

        for recipient in recipients {
            let to: Mailbox = match recipient.address.parse() {
                Ok(mb) => mb,
                Err(e) => {
                    reports.push(RecipientReport {
                        recipient: recipient.address.clone(),
                        success: false,
                        provider_id: None,
                        modem_id: None,
                        modem_name: None,
                        error: Some(format!("Invalid address: {}", e)),
                    });
                    last_error = Some(SendError::permanent(
                        "INVALID_RECIPIENT",
                        format!("Invalid email address: {}", recipient.address),
                    ));
                    continue;
                }
            };

            let message = Message::builder()
                .from(from.clone())
                .to(to)
                .subject(&subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.clone())
                .map_err(|e| SendError::permanent("EMAIL_BUILD", e.to_string()))?;

            match transport.send(message).await {
                Ok(response) => {
                    debug!(
                        alarm_id = alarm.id,
                        recipient = %recipient.address,
                        "Email delivered"
                    );
                    reports.push(RecipientReport {
                        recipient: recipient.address.clone(),
                        success: true,
                        provider_id: Some(response.code().to_string()),
                        modem_id: None,
                        modem_name: None,
                        error: None,
                    });
                }
                Err(e) => {
                    let classified = Self::classify(&e);
                    warn!(
                        alarm_id = alarm.id,
                        recipient = %recipient.address,
                        error = %e,
                        retryable = classified.retryable,
                        "Email send failed"
                    );
                    reports.push(RecipientReport {
                        recipient: recipient.address.clone(),
                        success: false,
                        provider_id: None,
                        modem_id: None,
                        modem_name: None,
                        error: Some(e.to_string()),
                    });
                    last_error = Some(classified);
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
            modem_id: None,
            modem_name: None,
            tier: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StaticMockMode;

    fn alarm() -> Alarm {
        serde_json::from_value(serde_json::json!({
            "id": 5,
            "imei": "356307042441013",
            "status": "SOS",
            "priority": 9,
            "is_email": true
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn mock_mode_reports_every_recipient() {
        let adapter = EmailAdapter::new(
            SmtpConfig::default(),
            Arc::new(StaticMockMode {
                mock_email: true,
                ..Default::default()
            }),
        );
        assert!(adapter.is_ready());

        let recipients = vec![
            Recipient {
                name: "Ops".to_string(),
                address: "ops@example.com".to_string(),
            },
            Recipient {
                name: "Driver".to_string(),
                address: "driver@example.com".to_string(),
            },
        ];

        let report = adapter.send(&alarm(), &recipients).await.unwrap();
        assert!(report.success);
        assert_eq!(report.provider, "mock-email");
        assert_eq!(report.recipients.len(), 2);
        assert!(report.recipients.iter().all(|r| r.success));
    }

    #[test]
    fn subject_and_body_carry_alarm_fields() {
        let alarm = alarm();
        assert!(EmailAdapter::subject(&alarm).contains("SOS"));
        assert!(EmailAdapter::body(&alarm).contains("Priority: 9"));
    }
}
