//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "fleetwatch.toml",
    "./config/config.toml",
    "./config/fleetwatch.toml",
    "/etc/fleetwatch/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then resolve encrypted values.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        config.resolve_secrets()?;
        config.validate()?;
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check FLEETWATCH_CONFIG env var
        if let Ok(path) = env::var("FLEETWATCH_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Database
        if let Ok(val) = env::var("FLEETWATCH_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // AMQP
        if let Ok(val) = env::var("FLEETWATCH_AMQP_URL") {
            config.amqp.url = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_AMQP_EXCHANGE") {
            config.amqp.exchange = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_AMQP_QUEUE") {
            config.amqp.queue = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_AMQP_ROUTING_KEY") {
            config.amqp.routing_key = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_AMQP_PREFETCH") {
            if let Ok(n) = val.parse() {
                config.amqp.prefetch = n;
            }
        }
        if let Ok(val) = env::var("FLEETWATCH_AMQP_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.amqp.max_reconnect_attempts = n;
            }
        }

        // Channels
        for (name, ch) in [
            ("EMAIL", &mut config.channels.email),
            ("SMS", &mut config.channels.sms),
            ("VOICE", &mut config.channels.voice),
        ] {
            if let Ok(val) = env::var(format!("FLEETWATCH_{}_MAX_CONCURRENCY", name)) {
                if let Ok(n) = val.parse() {
                    ch.max_concurrency = n;
                }
            }
            if let Ok(val) = env::var(format!("FLEETWATCH_{}_MAX_RETRIES", name)) {
                if let Ok(n) = val.parse() {
                    ch.max_retries = n;
                }
            }
        }

        // Circuit breaker
        if let Ok(val) = env::var("FLEETWATCH_BREAKER_FAILURE_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.circuit_breaker.failure_threshold = n;
            }
        }
        if let Ok(val) = env::var("FLEETWATCH_BREAKER_SUCCESS_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.circuit_breaker.success_threshold = n;
            }
        }
        if let Ok(val) = env::var("FLEETWATCH_BREAKER_OPEN_TIMEOUT_SECONDS") {
            if let Ok(n) = val.parse() {
                config.circuit_breaker.open_timeout_seconds = n;
            }
        }

        // Dedup
        if let Ok(val) = env::var("FLEETWATCH_DEDUP_WINDOW_MINUTES") {
            if let Ok(n) = val.parse() {
                config.dedup.window_minutes = n;
            }
        }

        // DLQ
        if let Ok(val) = env::var("FLEETWATCH_DLQ_ALERT_THRESHOLD") {
            if let Ok(n) = val.parse() {
                config.dlq.alert_threshold = n;
            }
        }
        if let Ok(val) = env::var("FLEETWATCH_DLQ_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.dlq.batch_size = n;
            }
        }
        if let Ok(val) = env::var("FLEETWATCH_DLQ_REPROCESS_INTERVAL_SECONDS") {
            if let Ok(n) = val.parse() {
                config.dlq.auto_reprocess_interval_seconds = n;
            }
        }

        // SMTP
        if let Ok(val) = env::var("FLEETWATCH_SMTP_HOST") {
            config.smtp.host = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_SMTP_PORT") {
            if let Ok(n) = val.parse() {
                config.smtp.port = n;
            }
        }
        if let Ok(val) = env::var("FLEETWATCH_SMTP_USERNAME") {
            config.smtp.username = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_SMTP_PASSWORD") {
            config.smtp.password = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_SMTP_FROM") {
            config.smtp.from_address = val;
        }

        // Voice provider
        if let Ok(val) = env::var("FLEETWATCH_VOICE_ENDPOINT") {
            config.voice.endpoint = val;
        }
        if let Ok(val) = env::var("FLEETWATCH_VOICE_API_KEY") {
            config.voice.api_key = val;
        }

        // Worker registry
        if let Ok(val) = env::var("FLEETWATCH_WORKER_HEARTBEAT_SECONDS") {
            if let Ok(n) = val.parse() {
                config.worker_registry.heartbeat_interval_seconds = n;
            }
        }

        // Secrets
        if let Ok(val) = env::var("FLEETWATCH_ENCRYPTION_KEY") {
            config.secrets.encryption_key = Some(val);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
