//! PostgreSQL Alarm Store Implementation
//!
//! Implements the `AlarmStore` trait over the platform schema. JSON columns
//! (alarm state, DLQ payload) are read and written as text and parsed with
//! serde_json; timestamps are `timestamptz` bound through chrono.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::debug;

use crate::repository::{AlarmStore, NewDlqItem, WorkerCleanup};
use fw_common::{
    Alarm, Channel, Contact, ContactType, DedupRecord, DlqItem, DlqSummary, Modem, ModemHealth,
    NotificationAttempt, QuietHours, ServiceTag, SystemRunState, SystemState, Worker,
};

/// PostgreSQL implementation of `AlarmStore`
pub struct PostgresAlarmStore {
    pool: PgPool,
}

impl PostgresAlarmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_alarm(row: &sqlx::postgres::PgRow) -> Result<Alarm> {
        let state: Option<String> = row.try_get("state").ok().flatten();
        let state = match state {
            Some(raw) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            None => serde_json::Value::Null,
        };

        Ok(Alarm {
            id: row.get("id"),
            imei: row.get("imei"),
            status: row.get("status"),
            category: row.try_get("category").ok().flatten(),
            priority: row.get::<i16, _>("priority").clamp(0, 10) as u8,
            gps_time: row.try_get("gps_time").ok().flatten(),
            server_time: row.try_get("server_time").ok().flatten(),
            created_at: row.try_get("created_at").ok().flatten(),
            latitude: row.try_get("latitude").ok().flatten(),
            longitude: row.try_get("longitude").ok().flatten(),
            altitude: row.try_get("altitude").ok().flatten(),
            angle: row.try_get("angle").ok().flatten(),
            satellites: row.try_get("satellites").ok().flatten(),
            speed: row.try_get("speed").ok().flatten(),
            is_email: row.get("is_email"),
            is_sms: row.get("is_sms"),
            is_call: row.get("is_call"),
            email_sent: row.get("email_sent"),
            sms_sent: row.get("sms_sent"),
            call_sent: row.get("call_sent"),
            is_valid: row.get("is_valid"),
            state,
            reference_id: row.try_get("reference_id").ok().flatten(),
            distance: row.try_get("distance").ok().flatten(),
        })
    }

    fn parse_contact(row: &sqlx::postgres::PgRow) -> Result<Contact> {
        let contact_type: String = row.get("contact_type");
        let contact_type = ContactType::from_str(&contact_type)
            .ok_or_else(|| anyhow!("Unknown contact_type: {}", contact_type))?;

        let quiet_hours = match (
            row.try_get::<Option<i32>, _>("quiet_start_minute").ok().flatten(),
            row.try_get::<Option<i32>, _>("quiet_end_minute").ok().flatten(),
        ) {
            (Some(start), Some(end)) => Some(QuietHours {
                start_minute: start as u16,
                end_minute: end as u16,
                utc_offset_minutes: row
                    .try_get::<Option<i32>, _>("quiet_utc_offset_minutes")
                    .ok()
                    .flatten()
                    .unwrap_or(0),
            }),
            _ => None,
        };

        Ok(Contact {
            id: row.get("id"),
            imei: row.get("imei"),
            name: row.get("name"),
            email: row.try_get("email").ok().flatten(),
            phone: row.try_get("phone").ok().flatten(),
            contact_type,
            priority: row.get("priority"),
            active: row.get("active"),
            quiet_hours,
            bounce_count: row.get("bounce_count"),
            last_bounce_at: row.try_get("last_bounce_at").ok().flatten(),
        })
    }

    fn parse_dlq_item(row: &sqlx::postgres::PgRow) -> Result<DlqItem> {
        let channel: String = row.get("channel");
        let channel =
            Channel::from_str(&channel).ok_or_else(|| anyhow!("Unknown channel: {}", channel))?;
        let payload: String = row.get("payload");

        Ok(DlqItem {
            id: row.get("id"),
            alarm_id: row.get("alarm_id"),
            imei: row.get("imei"),
            channel,
            payload: serde_json::from_str(&payload)?,
            error_message: row.get("error_message"),
            error_type: row.get("error_type"),
            attempts: row.get("attempts"),
            last_attempt_at: row.try_get("last_attempt_at").ok().flatten(),
            created_at: row.get("created_at"),
            reprocessed: row.get("reprocessed"),
            reprocessed_at: row.try_get("reprocessed_at").ok().flatten(),
        })
    }

    fn parse_modem(row: &sqlx::postgres::PgRow) -> Result<Modem> {
        let health: String = row.get("health");
        let services: Vec<String> = row.get("allowed_services");

        Ok(Modem {
            id: row.get("id"),
            name: row.get("name"),
            endpoint: row.get("endpoint"),
            username: row.try_get("username").ok().flatten(),
            password: row.try_get("password").ok().flatten(),
            modem_hw_id: row.try_get("modem_hw_id").ok().flatten(),
            enabled: row.get("enabled"),
            priority: row.get("priority"),
            max_concurrent: row.get::<i32, _>("max_concurrent").max(1) as u32,
            health: ModemHealth::from_str(&health),
            last_health_check: row.try_get("last_health_check").ok().flatten(),
            sms_sent_count: row.get("sms_sent_count"),
            sms_limit: row.get("sms_limit"),
            package_cost: row.get("package_cost"),
            package_currency: row.get("package_currency"),
            package_end_date: row.try_get("package_end_date").ok().flatten(),
            allowed_services: services
                .iter()
                .filter_map(|s| ServiceTag::from_str(s))
                .collect(),
        })
    }
}

#[async_trait]
impl AlarmStore for PostgresAlarmStore {
    // ========================================================================
    // Alarms
    // ========================================================================

    async fn get_alarm(&self, alarm_id: i64) -> Result<Option<Alarm>> {
        let row = sqlx::query(
            "SELECT id, imei, status, category, priority, gps_time, server_time, created_at, \
             latitude, longitude, altitude, angle, satellites, speed, \
             is_email, is_sms, is_call, email_sent, sms_sent, call_sent, \
             is_valid, state::text AS state, reference_id, distance \
             FROM alarms WHERE id = $1",
        )
        .bind(alarm_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_alarm).transpose()
    }

    async fn mark_channel_sent(&self, alarm_id: i64, channel: Channel) -> Result<()> {
        let column = match channel {
            Channel::Email => "email_sent",
            Channel::Sms => "sms_sent",
            Channel::Voice => "call_sent",
        };
        let query = format!("UPDATE alarms SET {} = TRUE WHERE id = $1", column);

        sqlx::query(&query).bind(alarm_id).execute(&self.pool).await?;

        debug!(alarm_id = alarm_id, channel = %channel, "Marked channel sent");
        Ok(())
    }

    // ========================================================================
    // Contacts & Quiet Hours
    // ========================================================================

    async fn active_contacts(&self, imei: &str) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "SELECT id, imei, name, email, phone, contact_type, priority, active, \
             quiet_start_minute, quiet_end_minute, quiet_utc_offset_minutes, \
             bounce_count, last_bounce_at \
             FROM contacts WHERE imei = $1 AND active = TRUE ORDER BY priority ASC",
        )
        .bind(imei)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_contact).collect()
    }

    async fn device_quiet_hours(&self, imei: &str) -> Result<Option<QuietHours>> {
        let row = sqlx::query(
            "SELECT start_minute, end_minute, utc_offset_minutes \
             FROM device_quiet_hours WHERE imei = $1",
        )
        .bind(imei)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| QuietHours {
            start_minute: r.get::<i32, _>("start_minute") as u16,
            end_minute: r.get::<i32, _>("end_minute") as u16,
            utc_offset_minutes: r.get("utc_offset_minutes"),
        }))
    }

    // ========================================================================
    // Deduplication
    // ========================================================================

    async fn find_dedup(&self, imei: &str, alarm_type: &str) -> Result<Option<DedupRecord>> {
        let row = sqlx::query(
            "SELECT imei, alarm_type, first_occurrence, last_occurrence, \
             occurrence_count, notification_sent \
             FROM alarm_dedup WHERE imei = $1 AND alarm_type = $2",
        )
        .bind(imei)
        .bind(alarm_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DedupRecord {
            imei: r.get("imei"),
            alarm_type: r.get("alarm_type"),
            first_occurrence: r.get("first_occurrence"),
            last_occurrence: r.get("last_occurrence"),
            occurrence_count: r.get("occurrence_count"),
            notification_sent: r.get("notification_sent"),
        }))
    }

    async fn increment_dedup(
        &self,
        imei: &str,
        alarm_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE alarm_dedup SET occurrence_count = occurrence_count + 1, \
             last_occurrence = $3 WHERE imei = $1 AND alarm_type = $2",
        )
        .bind(imei)
        .bind(alarm_type)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(imei = %imei, alarm_type = %alarm_type, "Incremented dedup counter");
        Ok(())
    }

    async fn reset_dedup(&self, imei: &str, alarm_type: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO alarm_dedup \
             (imei, alarm_type, first_occurrence, last_occurrence, occurrence_count, notification_sent) \
             VALUES ($1, $2, $3, $3, 1, TRUE) \
             ON CONFLICT (imei, alarm_type) DO UPDATE SET \
             first_occurrence = $3, last_occurrence = $3, occurrence_count = 1, \
             notification_sent = TRUE",
        )
        .bind(imei)
        .bind(alarm_type)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Notification Audit
    // ========================================================================

    async fn has_successful_attempt(&self, alarm_id: i64, channel: Channel) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS found FROM notification_attempts \
             WHERE alarm_id = $1 AND channel = $2 AND status = 'success' LIMIT 1",
        )
        .bind(alarm_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn insert_attempt(&self, attempt: &NotificationAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO notification_attempts \
             (alarm_id, imei, gps_time, channel, recipient, status, error, \
              provider_message_id, provider, modem_id, modem_name, sent_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(attempt.alarm_id)
        .bind(&attempt.imei)
        .bind(attempt.gps_time)
        .bind(attempt.channel.as_str())
        .bind(&attempt.recipient)
        .bind(attempt.status.as_str())
        .bind(&attempt.error)
        .bind(&attempt.provider_message_id)
        .bind(&attempt.provider)
        .bind(attempt.modem_id)
        .bind(&attempt.modem_name)
        .bind(attempt.sent_at)
        .execute(&self.pool)
        .await?;

        debug!(
            alarm_id = attempt.alarm_id,
            channel = %attempt.channel,
            recipient = %attempt.recipient,
            status = attempt.status.as_str(),
            "Recorded notification attempt"
        );
        Ok(())
    }

    async fn cleanup_attempts(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notification_attempts WHERE sent_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Dead-Letter Queue
    // ========================================================================

    async fn insert_dlq_item(&self, item: NewDlqItem) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO alarm_dlq \
             (alarm_id, imei, channel, payload, error_message, error_type, \
              attempts, last_attempt_at, created_at, reprocessed) \
             VALUES ($1, $2, $3, $4::jsonb, $5, $6, $7, $8, $8, FALSE) RETURNING id",
        )
        .bind(item.alarm_id)
        .bind(&item.imei)
        .bind(item.channel.as_str())
        .bind(serde_json::to_string(&item.payload)?)
        .bind(&item.error_message)
        .bind(&item.error_type)
        .bind(item.attempts)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.get("id");
        debug!(
            dlq_id = id,
            alarm_id = item.alarm_id,
            channel = item.channel.as_str(),
            error_type = %item.error_type,
            "Inserted DLQ item"
        );
        Ok(id)
    }

    async fn get_dlq_item(&self, id: i64) -> Result<Option<DlqItem>> {
        let row = sqlx::query(
            "SELECT id, alarm_id, imei, channel, payload::text AS payload, error_message, \
             error_type, attempts, last_attempt_at, created_at, reprocessed, reprocessed_at \
             FROM alarm_dlq WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_dlq_item).transpose()
    }

    async fn fetch_dlq_batch(
        &self,
        limit: u32,
        channel: Option<Channel>,
        error_type: Option<&str>,
    ) -> Result<Vec<DlqItem>> {
        let mut query = String::from(
            "SELECT id, alarm_id, imei, channel, payload::text AS payload, error_message, \
             error_type, attempts, last_attempt_at, created_at, reprocessed, reprocessed_at \
             FROM alarm_dlq WHERE reprocessed = FALSE",
        );
        let mut arg = 1;
        if channel.is_some() {
            arg += 1;
            query.push_str(&format!(" AND channel = ${}", arg));
        }
        if error_type.is_some() {
            arg += 1;
            query.push_str(&format!(" AND error_type = ${}", arg));
        }
        query.push_str(" ORDER BY attempts ASC, created_at ASC LIMIT $1");

        let mut q = sqlx::query(&query).bind(limit as i64);
        if let Some(ch) = channel {
            q = q.bind(ch.as_str());
        }
        if let Some(et) = error_type {
            q = q.bind(et);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_dlq_item).collect()
    }

    async fn dlq_summary(&self) -> Result<DlqSummary> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, \
             COALESCE(MAX(attempts), 0) AS max_attempts, \
             COALESCE(AVG(EXTRACT(EPOCH FROM (NOW() - created_at))), 0)::float8 AS avg_age \
             FROM alarm_dlq WHERE reprocessed = FALSE",
        )
        .fetch_one(&self.pool)
        .await?;

        let by_channel_rows = sqlx::query(
            "SELECT channel, COUNT(*) AS count FROM alarm_dlq \
             WHERE reprocessed = FALSE GROUP BY channel",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_error_rows = sqlx::query(
            "SELECT error_type, COUNT(*) AS count FROM alarm_dlq \
             WHERE reprocessed = FALSE GROUP BY error_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_channel = HashMap::new();
        for row in &by_channel_rows {
            by_channel.insert(row.get::<String, _>("channel"), row.get::<i64, _>("count"));
        }
        let mut by_error_type = HashMap::new();
        for row in &by_error_rows {
            by_error_type.insert(row.get::<String, _>("error_type"), row.get::<i64, _>("count"));
        }

        Ok(DlqSummary {
            total: totals.get("total"),
            by_channel,
            by_error_type,
            average_age_seconds: totals
                .try_get::<f64, _>("avg_age")
                .unwrap_or(0.0),
            max_attempts: totals.get("max_attempts"),
        })
    }

    async fn mark_dlq_reprocessed(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE alarm_dlq SET reprocessed = TRUE, reprocessed_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        debug!(dlq_id = id, "Marked DLQ item reprocessed");
        Ok(())
    }

    async fn cleanup_dlq(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM alarm_dlq WHERE reprocessed = TRUE AND created_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Modems
    // ========================================================================

    async fn list_modems(&self) -> Result<Vec<Modem>> {
        let rows = sqlx::query(
            "SELECT id, name, endpoint, username, password, modem_hw_id, enabled, priority, \
             max_concurrent, health, last_health_check, sms_sent_count, sms_limit, \
             package_cost, package_currency, package_end_date, allowed_services \
             FROM modems ORDER BY priority ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_modem).collect()
    }

    async fn device_modem_id(&self, imei: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT modem_id FROM device_modems WHERE imei = $1")
            .bind(imei)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("modem_id")))
    }

    async fn increment_modem_counter(&self, modem_id: i64, day: NaiveDate) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE modems SET sms_sent_count = sms_sent_count + 1 \
             WHERE id = $1 RETURNING sms_sent_count",
        )
        .bind(modem_id)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO modem_daily_usage (modem_id, day, sent_count) VALUES ($1, $2, 1) \
             ON CONFLICT (modem_id, day) DO UPDATE SET sent_count = \
             modem_daily_usage.sent_count + 1",
        )
        .bind(modem_id)
        .bind(day)
        .execute(&self.pool)
        .await?;

        Ok(row.get("sms_sent_count"))
    }

    async fn set_modem_health(
        &self,
        modem_id: i64,
        health: ModemHealth,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE modems SET health = $2, last_health_check = $3 WHERE id = $1")
            .bind(modem_id)
            .bind(health.as_str())
            .bind(checked_at)
            .execute(&self.pool)
            .await?;

        debug!(modem_id = modem_id, health = health.as_str(), "Updated modem health");
        Ok(())
    }

    async fn reset_modem_package(&self, modem_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE modems SET sms_sent_count = 0, health = 'healthy' WHERE id = $1",
        )
        .bind(modem_id)
        .execute(&self.pool)
        .await?;

        debug!(modem_id = modem_id, "Reset modem package");
        Ok(())
    }

    // ========================================================================
    // System State
    // ========================================================================

    async fn get_system_state(&self) -> Result<SystemState> {
        let row = sqlx::query(
            "SELECT state, use_mock_sms, use_mock_email, paused_at, paused_by, reason \
             FROM system_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => SystemState {
                state: SystemRunState::from_str(&r.get::<String, _>("state")),
                use_mock_sms: r.get("use_mock_sms"),
                use_mock_email: r.get("use_mock_email"),
                paused_at: r.try_get("paused_at").ok().flatten(),
                paused_by: r.try_get("paused_by").ok().flatten(),
                reason: r.try_get("reason").ok().flatten(),
            },
            None => SystemState::default(),
        })
    }

    async fn set_system_state(&self, state: &SystemState) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_state (id, state, use_mock_sms, use_mock_email, paused_at, paused_by, reason) \
             VALUES (1, $1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET state = $1, use_mock_sms = $2, use_mock_email = $3, \
             paused_at = $4, paused_by = $5, reason = $6",
        )
        .bind(state.state.as_str())
        .bind(state.use_mock_sms)
        .bind(state.use_mock_email)
        .bind(state.paused_at)
        .bind(&state.paused_by)
        .bind(&state.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Feature Flags
    // ========================================================================

    async fn feature_flag(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT enabled FROM feature_flags WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("enabled")).unwrap_or(false))
    }

    async fn set_feature_flag(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO feature_flags (name, enabled) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET enabled = $2",
        )
        .bind(name)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Worker Registry
    // ========================================================================

    async fn upsert_worker(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, hostname, pid, started_at, last_heartbeat, status) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET started_at = $4, last_heartbeat = $5, status = $6",
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(worker.pid)
        .bind(worker.started_at)
        .bind(worker.last_heartbeat)
        .bind(worker.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn worker_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workers SET last_heartbeat = $2, status = 'active' WHERE id = $1",
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
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

        let stale = sqlx::query(
            "UPDATE workers SET status = 'stale' \
             WHERE status = 'active' AND last_heartbeat < $1 AND last_heartbeat >= $2",
        )
        .bind(stale_cutoff)
        .bind(dead_cutoff)
        .execute(&self.pool)
        .await?;

        let dead = sqlx::query(
            "UPDATE workers SET status = 'dead' \
             WHERE status != 'dead' AND last_heartbeat < $1",
        )
        .bind(dead_cutoff)
        .execute(&self.pool)
        .await?;

        let removed = sqlx::query(
            "DELETE FROM workers WHERE status = 'dead' AND last_heartbeat < $1",
        )
        .bind(removal_cutoff)
        .execute(&self.pool)
        .await?;

        Ok(WorkerCleanup {
            marked_stale: stale.rows_affected(),
            marked_dead: dead.rows_affected(),
            removed: removed.rows_affected(),
        })
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
