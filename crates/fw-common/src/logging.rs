//! Structured Logging
//!
//! Log output is `tracing`-based throughout the engine. Two concerns live
//! here:
//!
//! - Subscriber setup: JSON for production (`LOG_FORMAT=json`), readable
//!   text otherwise, filtered by `RUST_LOG` (default `info`, with the
//!   chattiest transport crates held at `warn`).
//! - Span constructors: every alarm travelling the pipeline is wrapped in
//!   an `alarm` span, and each channel task in a `delivery` span, so
//!   `alarm_id` / `imei` / `channel` ride along on every nested log line
//!   instead of being repeated at each call site.

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Transport crates that drown out the engine's own logs at `info`.
const DEFAULT_FILTER: &str = "info,lapin=warn,sqlx=warn,hyper=warn";

/// Log output format, selected by the `LOG_FORMAT` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable text (development default).
    Text,
    /// Flattened JSON lines for log aggregation.
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize logging for a service, honoring `LOG_FORMAT` and `RUST_LOG`.
pub fn init_logging(service_name: &str) {
    init_with_format(service_name, LogFormat::from_env());
}

/// Initialize logging with an explicit format (tools and tests).
pub fn init_with_format(service_name: &str, format: LogFormat) {
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_current_span(true)
                        .with_span_list(false)
                        .with_target(true),
                )
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_target(true).with_ansi(true))
                .init();
        }
    }
    tracing::info!(service = service_name, format = ?format, "Logging initialized");
}

/// Span wrapping one alarm's trip through the pipeline.
pub fn alarm_span(alarm_id: i64, imei: &str) -> Span {
    tracing::info_span!("alarm", alarm_id = alarm_id, imei = %imei)
}

/// Span wrapping one channel's delivery task within an alarm.
pub fn delivery_span(alarm_id: i64, imei: &str, channel: &str) -> Span {
    tracing::info_span!(
        "delivery",
        alarm_id = alarm_id,
        imei = %imei,
        channel = %channel
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_text() {
        std::env::remove_var("LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
    }

    #[test]
    fn default_filter_parses() {
        drop(EnvFilter::new(DEFAULT_FILTER));
    }

    #[test]
    fn delivery_span_carries_identity_fields() {
        let subscriber = tracing_subscriber::registry().with(env_filter());
        tracing::subscriber::with_default(subscriber, || {
            let span = delivery_span(7, "356307042441013", "sms");
            let meta = span.metadata().expect("span enabled at info");
            assert_eq!(meta.name(), "delivery");

            let fields: Vec<&str> = meta.fields().iter().map(|f| f.name()).collect();
            assert!(fields.contains(&"alarm_id"));
            assert!(fields.contains(&"imei"));
            assert!(fields.contains(&"channel"));
        });
    }

    #[test]
    fn alarm_span_carries_identity_fields() {
        let subscriber = tracing_subscriber::registry().with(env_filter());
        tracing::subscriber::with_default(subscriber, || {
            let span = alarm_span(9, "356307042441013");
            let meta = span.metadata().expect("span enabled at info");
            assert_eq!(meta.name(), "alarm");

            let fields: Vec<&str> = meta.fields().iter().map(|f| f.name()).collect();
            assert!(fields.contains(&"alarm_id"));
            assert!(fields.contains(&"imei"));
        });
    }
}
