//! Metrics infrastructure for the notification engine
//!
//! Prometheus-compatible metrics for:
//! - Alarm processing and per-channel delivery
//! - Retry, breaker, and DLQ activity
//! - Consumer pause/backpressure counters

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an alarm leaving the pipeline
pub fn record_alarm_processed(outcome: &str) {
    counter!(
        "fw_alarms_processed_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a per-channel delivery outcome
pub fn record_notification(channel: &str, success: bool) {
    counter!(
        "fw_notifications_total",
        "channel" => channel.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Record delivery latency against the channel's informational SLA
pub fn record_send_latency(channel: &str, duration: Duration, within_sla: bool) {
    histogram!(
        "fw_send_duration_seconds",
        "channel" => channel.to_string(),
        "within_sla" => within_sla.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry sleep
pub fn record_retry(channel: &str, attempt: u32) {
    counter!(
        "fw_send_retries_total",
        "channel" => channel.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Record a breaker rejection
pub fn record_breaker_rejection(channel: &str, rejection: &str) {
    counter!(
        "fw_breaker_rejections_total",
        "channel" => channel.to_string(),
        "rejection" => rejection.to_string()
    )
    .increment(1);
}

/// Record a dedup-window suppression
pub fn record_dedup_suppressed() {
    counter!("fw_dedup_suppressed_total").increment(1);
}

/// Record a quiet-hours suppression
pub fn record_quiet_hours_suppressed() {
    counter!("fw_quiet_hours_suppressed_total").increment(1);
}

/// Record a DLQ enqueue
pub fn record_dlq_enqueued(channel: &str, error_type: &str) {
    counter!(
        "fw_dlq_enqueued_total",
        "channel" => channel.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a DLQ replay outcome
pub fn record_dlq_reprocessed(success: bool) {
    counter!(
        "fw_dlq_reprocessed_total",
        "success" => success.to_string()
    )
    .increment(1);
}

/// Update the pending DLQ depth gauge
pub fn set_dlq_depth(depth: i64) {
    gauge!("fw_dlq_depth").set(depth as f64);
}

/// Record a message held back by the pause gate
pub fn record_paused_message() {
    counter!("fw_consumer_paused_messages_total").increment(1);
}

/// Record a consumer error
pub fn record_consumer_error(error_type: &str) {
    counter!(
        "fw_consumer_errors_total",
        "type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a queue-depth sample above the backpressure threshold
pub fn record_backpressure(depth: u32) {
    counter!("fw_consumer_backpressure_total").increment(1);
    gauge!("fw_queue_depth").set(depth as f64);
}

/// Update the queue depth gauge
pub fn set_queue_depth(depth: u32) {
    gauge!("fw_queue_depth").set(depth as f64);
}

/// Update a channel's in-flight gauge
pub fn set_channel_in_flight(channel: &str, count: u32) {
    gauge!(
        "fw_channel_in_flight",
        "channel" => channel.to_string()
    )
    .set(count as f64);
}
