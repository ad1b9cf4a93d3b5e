//! Alarm Payload Normalization
//!
//! Producers publish two shapes: flat channel booleans
//! (`is_email | is_sms | is_call`) and a nested `channels` map. Field names
//! arrive in either snake_case or camelCase. Everything normalizes into the
//! canonical `Alarm`; structurally invalid payloads are rejected for the
//! database DLQ.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use fw_common::Alarm;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsMap {
    #[serde(default)]
    email: bool,
    #[serde(default)]
    sms: bool,
    #[serde(default)]
    voice: bool,
}

/// The tolerant wire shape. `normalize` turns it into an `Alarm`.
#[derive(Debug, Deserialize)]
pub struct AlarmPayload {
    #[serde(default, alias = "alarmId")]
    id: Option<i64>,
    #[serde(default)]
    imei: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    state: Option<serde_json::Value>,

    #[serde(default)]
    channels: Option<ChannelsMap>,
    #[serde(default, alias = "isEmail")]
    is_email: Option<bool>,
    #[serde(default, alias = "isSms")]
    is_sms: Option<bool>,
    #[serde(default, alias = "isCall")]
    is_call: Option<bool>,

    #[serde(default, alias = "serverTime")]
    server_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "gpsTime")]
    gps_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "createdAt")]
    created_at: Option<DateTime<Utc>>,
    // Accepted from producers but not acted on here; scheduling happens
    // upstream of the queue.
    #[serde(default, alias = "scheduledAt")]
    #[allow(dead_code)]
    scheduled_at: Option<DateTime<Utc>>,

    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    altitude: Option<f64>,
    #[serde(default)]
    angle: Option<f64>,
    #[serde(default)]
    satellites: Option<i32>,
    #[serde(default)]
    speed: Option<f64>,

    #[serde(default, alias = "referenceId")]
    reference_id: Option<String>,
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default, alias = "retryCount")]
    #[allow(dead_code)]
    retry_count: Option<i64>,
}

impl AlarmPayload {
    /// Normalize into the canonical alarm, rejecting missing required
    /// fields (`alarmId | id`, `imei`, `status`).
    pub fn normalize(self) -> Result<Alarm, PayloadError> {
        let id = self.id.ok_or(PayloadError::MissingField("id"))?;
        let imei = match self.imei {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(PayloadError::MissingField("imei")),
        };
        let status = match self.status {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Err(PayloadError::MissingField("status")),
        };

        // Nested channels map wins over flat booleans when both appear.
        let (is_email, is_sms, is_call) = match self.channels {
            Some(map) => (map.email, map.sms, map.voice),
            None => (
                self.is_email.unwrap_or(false),
                self.is_sms.unwrap_or(false),
                self.is_call.unwrap_or(false),
            ),
        };

        Ok(Alarm {
            id,
            imei,
            status,
            category: self.category,
            priority: self.priority.unwrap_or(5).clamp(0, 10) as u8,
            gps_time: self.gps_time,
            server_time: self.server_time,
            created_at: self.created_at,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            angle: self.angle,
            satellites: self.satellites,
            speed: self.speed,
            is_email,
            is_sms,
            is_call,
            email_sent: false,
            sms_sent: false,
            call_sent: false,
            is_valid: true,
            state: self.state.unwrap_or(serde_json::Value::Null),
            reference_id: self.reference_id,
            distance: self.distance,
        })
    }
}

/// Parse raw message bytes into the canonical alarm.
pub fn parse_alarm_payload(bytes: &[u8]) -> Result<Alarm, PayloadError> {
    let payload: AlarmPayload = serde_json::from_slice(bytes)?;
    payload.normalize()
}

/// Best-effort identity extraction from a payload that failed to
/// normalize, so it can still be parked in the database DLQ.
pub fn salvage_identity(bytes: &[u8]) -> Option<(i64, String)> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let id = value
        .get("alarmId")
        .or_else(|| value.get("id"))
        .and_then(|v| v.as_i64())?;
    let imei = match value.get("imei") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return None,
    };
    Some((id, imei))
}
