//! Voice Channel Adapter
//!
//! Places calls through the voice provider's HTTP API. Response codes are
//! classified the same way as the other transports: 429 and 5xx retry, other
//! 4xx short-circuit.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::adapter::{
    format_alarm_text, ChannelAdapter, ChannelSendReport, Recipient, RecipientReport, SendError,
};
use fw_common::{Alarm, Channel};
use fw_config::VoiceProviderConfig;

#[derive(Debug, Deserialize)]
struct CallResponse {
    #[serde(default)]
    call_id: Option<String>,
}

pub struct VoiceAdapter {
    client: reqwest::Client,
    config: VoiceProviderConfig,
}

impl VoiceAdapter {
    pub fn new(config: VoiceProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    async fn place_call(&self, alarm: &Alarm, phone: &str) -> Result<String, SendError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "to": phone,
                "caller_id": self.config.caller_id,
                "message": format_alarm_text(alarm),
                "reference": alarm.id,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    SendError::retryable("VOICE_UNREACHABLE", e.to_string())
                } else {
                    SendError::retryable("VOICE_REQUEST_FAILED", e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let body: CallResponse = response.json().await.unwrap_or(CallResponse { call_id: None });
            Ok(body.call_id.unwrap_or_else(|| "unknown".to_string()))
        } else if status.as_u16() == 429 {
            Err(SendError::retryable(
                "VOICE_RATE_LIMITED",
                "Provider rate limit",
            ))
        } else if status.is_client_error() {
            Err(SendError::permanent(
                "VOICE_REJECTED",
                format!("HTTP {}", status.as_u16()),
            ))
        } else {
            Err(SendError::retryable(
                "VOICE_PROVIDER_ERROR",
                format!("HTTP {}", status.as_u16()),
            ))
        }
    }
}

#[async_trait]
impl ChannelAdapter for VoiceAdapter {
    fn channel(&self) -> Channel {
        Channel::Voice
    }

    fn provider(&self) -> &str {
        "voice-provider"
    }

    fn is_ready(&self) -> bool {
        !self.config.endpoint.is_empty()
    }

    async fn send(
        &self,
        alarm: &Alarm,
        recipients: &[Recipient],
    ) -> Result<ChannelSendReport, SendError> {
        let mut reports = Vec::with_capacity(recipients.len());
        let mut last_error: Option<SendError> = None;

        for recipient in recipients {
            match self.place_call(alarm, &recipient.address).await {
                Ok(call_id) => {
                    debug!(
                        alarm_id = alarm.id,
                        recipient = %recipient.address,
                        call_id = %call_id,
                        "Voice call placed"
                    );
                    reports.push(RecipientReport {
                        recipient: recipient.address.clone(),
                        success: true,
                        provider_id: Some(call_id),
                        modem_id: None,
                        modem_name: None,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(
                        alarm_id = alarm.id,
                        recipient = %recipient.address,
                        error = %e,
                        "Voice call failed"
                    );
                    reports.push(RecipientReport {
                        recipient: recipient.address.clone(),
                        success: false,
                        provider_id: None,
                        modem_id: None,
                        modem_name: None,
                        error: Some(e.to_string()),
                    });
                    last_error = Some(e);
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
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alarm() -> Alarm {
        serde_json::from_value(serde_json::json!({
            "id": 7,
            "imei": "356307042441013",
            "status": "SOS",
            "is_call": true
        }))
        .unwrap()
    }

    fn recipient() -> Recipient {
        Recipient {
            name: "Ops".to_string(),
            address: "+4917012345".to_string(),
        }
    }

    async fn adapter_for(server: &MockServer) -> VoiceAdapter {
        VoiceAdapter::new(VoiceProviderConfig {
            endpoint: format!("{}/calls", server.uri()),
            api_key: "test-key".to_string(),
            caller_id: "FleetWatch".to_string(),
            timeout_seconds: 5,
        })
    }

    #[tokio::test]
    async fn successful_call_returns_call_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calls"))
            .and(body_partial_json(serde_json::json!({"to": "+4917012345"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "call_id": "call-42"
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let report = adapter.send(&alarm(), &[recipient()]).await.unwrap();

        assert!(report.success);
        assert_eq!(report.message_id.as_deref(), Some("call-42"));
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let err = adapter.send(&alarm(), &[recipient()]).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.error_type, "VOICE_PROVIDER_ERROR");
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let err = adapter.send(&alarm(), &[recipient()]).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type, "VOICE_REJECTED");
    }
}
