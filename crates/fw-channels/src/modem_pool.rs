//! SMS Modem Pool
//!
//! Multi-tier modem selection with quota accounting and health checks:
//! - Tier 1 (device): the alarm's IMEI maps to a specific modem
//! - Tier 2 (service): modems scoped to the call's service tag, ordered by
//!   health then remaining quota
//! - Tier 3 (fallback): any available modem
//!
//! State lives in two layers: the in-memory cache (modem rows, in-flight
//! counters, per-modem semaphores) and the authoritative database row.
//! Quota increments go to both; a store failure after a transport success
//! leaves the send successful and the cache heals on the next reload.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use async_trait::async_trait;
use fw_common::{Modem, ModemHealth, SelectionTier, ServiceTag};
use fw_config::ModemPoolConfig;
use fw_store::AlarmStore;

/// Transport-level failure from a modem.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// The wire seam to a physical modem. The pool owns selection and
/// accounting; the transport only moves bytes.
#[async_trait]
pub trait ModemTransport: Send + Sync {
    /// Send one SMS, returning the provider message id.
    async fn send_sms(&self, modem: &Modem, to: &str, text: &str)
        -> Result<String, TransportError>;

    /// Probe the modem. Ok means reachable and responsive.
    async fn health_check(&self, modem: &Modem) -> Result<(), TransportError>;

    /// Send to the mock endpoint instead of a real modem.
    async fn send_mock(&self, endpoint: &str, to: &str, text: &str)
        -> Result<String, TransportError>;
}

/// Successful send outcome with accounting details.
#[derive(Debug, Clone)]
pub struct SmsSendResult {
    pub modem_id: i64,
    pub modem_name: String,
    pub tier: SelectionTier,
    pub provider_message_id: String,
}

/// Snapshot of one modem for observability.
#[derive(Debug, Clone)]
pub struct ModemStats {
    pub id: i64,
    pub name: String,
    pub health: ModemHealth,
    pub sms_sent_count: i64,
    pub sms_limit: i64,
    pub in_flight: u32,
    pub cost_per_sms: f64,
}

/// Fleet-wide cost accounting over enabled, quota'd modems.
#[derive(Debug, Clone, Default)]
pub struct FleetCostSummary {
    pub total_package_cost: f64,
    pub total_sms_limit: i64,
    pub average_cost_per_sms: f64,
}

struct ModemEntry {
    modem: RwLock<Modem>,
    in_flight: AtomicU32,
    semaphore: Arc<Semaphore>,
}

impl ModemEntry {
    fn new(modem: Modem) -> Self {
        let permits = modem.max_concurrent.max(1) as usize;
        Self {
            modem: RwLock::new(modem),
            in_flight: AtomicU32::new(0),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Selectable for dispatch right now: enabled, health not blocked,
    /// quota remaining, a concurrency slot free.
    fn is_available(&self) -> bool {
        let modem = self.modem.read();
        modem.enabled
            && modem.health.is_selectable()
            && modem.has_quota()
            && self.in_flight.load(Ordering::SeqCst) < modem.max_concurrent
    }
}

/// The modem pool (C5)
pub struct ModemPool {
    store: Arc<dyn AlarmStore>,
    transport: Arc<dyn ModemTransport>,
    config: ModemPoolConfig,
    entries: DashMap<i64, Arc<ModemEntry>>,
}

impl ModemPool {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        transport: Arc<dyn ModemTransport>,
        config: ModemPoolConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            entries: DashMap::new(),
        }
    }

    /// Refresh the in-memory cache from the store. Existing entries keep
    /// their in-flight counters; changed rows replace the cached modem.
    pub async fn reload(&self) -> anyhow::Result<usize> {
        let modems = self.store.list_modems().await?;
        let mut seen = Vec::with_capacity(modems.len());

        for modem in modems {
            seen.push(modem.id);
            match self.entries.get(&modem.id) {
                Some(entry) => {
                    *entry.modem.write() = modem;
                }
                None => {
                    self.entries.insert(modem.id, Arc::new(ModemEntry::new(modem)));
                }
            }
        }
        self.entries.retain(|id, _| seen.contains(id));

        info!(count = self.entries.len(), "Modem pool reloaded");
        Ok(self.entries.len())
    }

    /// Send one SMS for `imei` to `phone`, walking the selection tiers.
    pub async fn send(
        &self,
        imei: &str,
        phone: &str,
        text: &str,
        service: ServiceTag,
        mock: bool,
    ) -> Result<SmsSendResult, TransportError> {
        if mock {
            return self.send_via_mock(phone, text).await;
        }

        // Tier 1: device-specific modem
        if let Ok(Some(modem_id)) = self.store.device_modem_id(imei).await {
            if let Some(entry) = self.entries.get(&modem_id).map(|e| Arc::clone(&e)) {
                if entry.is_available() {
                    match self.try_send_via(&entry, phone, text).await {
                        Ok(result) => {
                            return Ok(SmsSendResult {
                                tier: SelectionTier::Device,
                                ..result
                            })
                        }
                        Err(e) => {
                            self.mark_degraded(&entry).await;
                            debug!(
                                imei = %imei,
                                modem_id = modem_id,
                                error = %e,
                                "Device modem failed, falling through"
                            );
                        }
                    }
                }
            }
        }

        // Tier 2: service-scoped candidates
        if let Some(result) = self
            .try_tier(phone, text, Some(service), SelectionTier::Service)
            .await
        {
            return Ok(result);
        }

        // Tier 3: any available modem
        if let Some(result) = self
            .try_tier(phone, text, None, SelectionTier::Fallback)
            .await
        {
            return Ok(result);
        }

        Err(TransportError::permanent(format!(
            "No modem available for {} (service {})",
            imei,
            service.as_str()
        )))
    }

    /// Try up to `candidates_per_tier` modems in a tier; failures mark the
    /// modem degraded and advance to the next candidate.
    async fn try_tier(
        &self,
        phone: &str,
        text: &str,
        service: Option<ServiceTag>,
        tier: SelectionTier,
    ) -> Option<SmsSendResult> {
        let candidates = self.select_candidates(service);

        for entry in candidates.into_iter().take(self.config.candidates_per_tier) {
            match self.try_send_via(&entry, phone, text).await {
                Ok(result) => return Some(SmsSendResult { tier, ..result }),
                Err(e) => {
                    let modem_id = entry.modem.read().id;
                    self.mark_degraded(&entry).await;
                    debug!(
                        modem_id = modem_id,
                        tier = tier.as_str(),
                        error = %e,
                        "Modem send failed, trying next candidate"
                    );
                }
            }
        }
        None
    }

    /// Available modems for a tier, ordered by health (healthy before
    /// degraded before unknown) then remaining quota descending.
    fn select_candidates(&self, service: Option<ServiceTag>) -> Vec<Arc<ModemEntry>> {
        let mut candidates: Vec<(u8, i64, Arc<ModemEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.is_available())
            .filter(|e| match service {
                Some(tag) => e.modem.read().allows_service(tag),
                None => true,
            })
            .map(|e| {
                let modem = e.modem.read();
                (modem.health.selection_rank(), modem.remaining_quota(), Arc::clone(&e))
            })
            .collect();

        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        candidates.into_iter().map(|(_, _, e)| e).collect()
    }

    /// One guarded send on one modem, with quota accounting on success.
    async fn try_send_via(
        &self,
        entry: &Arc<ModemEntry>,
        phone: &str,
        text: &str,
    ) -> Result<SmsSendResult, TransportError> {
        let permit = entry
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| TransportError::retryable("Modem at max concurrency"))?;

        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        let modem = entry.modem.read().clone();

        let result = self.transport.send_sms(&modem, phone, text).await;

        entry.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        let provider_message_id = result?;
        self.record_send(entry).await;

        Ok(SmsSendResult {
            modem_id: modem.id,
            modem_name: modem.name,
            tier: SelectionTier::Fallback, // caller overwrites with its tier
            provider_message_id,
        })
    }

    /// Count a successful send in memory and in the store; flip to
    /// quota_exhausted at the limit. A store failure is logged and the send
    /// stays successful (the cache heals on the next reload).
    async fn record_send(&self, entry: &Arc<ModemEntry>) {
        let (modem_id, new_count, limit) = {
            let mut modem = entry.modem.write();
            modem.sms_sent_count += 1;
            (modem.id, modem.sms_sent_count, modem.sms_limit)
        };

        if let Err(e) = self
            .store
            .increment_modem_counter(modem_id, Utc::now().date_naive())
            .await
        {
            warn!(modem_id = modem_id, error = %e, "Quota counter write failed after send");
        }

        if new_count >= limit {
            entry.modem.write().health = ModemHealth::QuotaExhausted;
            if let Err(e) = self
                .store
                .set_modem_health(modem_id, ModemHealth::QuotaExhausted, Utc::now())
                .await
            {
                warn!(modem_id = modem_id, error = %e, "Quota-exhausted flag write failed");
            }
            info!(modem_id = modem_id, limit = limit, "Modem quota exhausted");
        }
    }

    async fn mark_degraded(&self, entry: &Arc<ModemEntry>) {
        let modem_id = {
            let mut modem = entry.modem.write();
            // Quota exhaustion outranks degradation
            if modem.health == ModemHealth::QuotaExhausted {
                return;
            }
            modem.health = ModemHealth::Degraded;
            modem.id
        };
        if let Err(e) = self
            .store
            .set_modem_health(modem_id, ModemHealth::Degraded, Utc::now())
            .await
        {
            warn!(modem_id = modem_id, error = %e, "Degraded flag write failed");
        }
    }

    async fn send_via_mock(&self, phone: &str, text: &str) -> Result<SmsSendResult, TransportError> {
        let provider_message_id = self
            .transport
            .send_mock(&self.config.mock_endpoint, phone, text)
            .await?;

        // Count against the designated mock modem when it exists
        let mock_id = self.config.mock_modem_id;
        if let Some(entry) = self.entries.get(&mock_id).map(|e| Arc::clone(&e)) {
            self.record_send(&entry).await;
        }

        Ok(SmsSendResult {
            modem_id: mock_id,
            modem_name: "mock".to_string(),
            tier: SelectionTier::Mock,
            provider_message_id,
        })
    }

    /// Probe every enabled modem once and apply healthy/unhealthy
    /// transitions. Quota exhaustion is not cleared by a probe.
    pub async fn health_check_all(&self) {
        let entries: Vec<Arc<ModemEntry>> = self
            .entries
            .iter()
            .filter(|e| e.modem.read().enabled)
            .map(|e| Arc::clone(&e))
            .collect();

        for entry in entries {
            let modem = entry.modem.read().clone();
            let outcome = self.transport.health_check(&modem).await;
            let now = Utc::now();

            let new_health = match (&outcome, modem.health) {
                (_, ModemHealth::QuotaExhausted) => None,
                (Ok(()), ModemHealth::Healthy) => None,
                (Ok(()), _) => Some(ModemHealth::Healthy),
                (Err(_), ModemHealth::Unhealthy) => None,
                (Err(_), _) => Some(ModemHealth::Unhealthy),
            };

            if let Some(health) = new_health {
                info!(
                    modem_id = modem.id,
                    from = modem.health.as_str(),
                    to = health.as_str(),
                    "Modem health transition"
                );
                entry.modem.write().health = health;
                if let Err(e) = self.store.set_modem_health(modem.id, health, now).await {
                    warn!(modem_id = modem.id, error = %e, "Health write failed");
                }
            } else {
                entry.modem.write().last_health_check = Some(now);
            }
        }
    }

    /// Package renewal: zero the counter, restore health.
    pub async fn reset_package(&self, modem_id: i64) -> anyhow::Result<()> {
        self.store.reset_modem_package(modem_id).await?;
        if let Some(entry) = self.entries.get(&modem_id) {
            let mut modem = entry.modem.write();
            modem.sms_sent_count = 0;
            modem.health = ModemHealth::Healthy;
        }
        info!(modem_id = modem_id, "Modem package reset");
        Ok(())
    }

    pub fn stats(&self) -> Vec<ModemStats> {
        self.entries
            .iter()
            .map(|e| {
                let modem = e.modem.read();
                ModemStats {
                    id: modem.id,
                    name: modem.name.clone(),
                    health: modem.health,
                    sms_sent_count: modem.sms_sent_count,
                    sms_limit: modem.sms_limit,
                    in_flight: e.in_flight.load(Ordering::SeqCst),
                    cost_per_sms: modem.cost_per_sms(),
                }
            })
            .collect()
    }

    /// Fleet average = sum(package_cost) / sum(sms_limit) over enabled,
    /// quota'd modems.
    pub fn fleet_cost_summary(&self) -> FleetCostSummary {
        let mut total_cost = 0.0;
        let mut total_limit = 0i64;

        for entry in self.entries.iter() {
            let modem = entry.modem.read();
            if modem.enabled && modem.sms_limit > 0 {
                total_cost += modem.package_cost;
                total_limit += modem.sms_limit;
            }
        }

        FleetCostSummary {
            total_package_cost: total_cost,
            total_sms_limit: total_limit,
            average_cost_per_sms: if total_limit > 0 {
                total_cost / total_limit as f64
            } else {
                0.0
            },
        }
    }

    /// Periodic health-check loop; runs until shutdown.
    pub fn spawn_health_check_loop(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self;
        let interval = Duration::from_secs(pool.config.health_check_interval_seconds.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.health_check_all().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Modem health checker shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// HTTP transport to physical modems (and the mock endpoint).
pub struct HttpModemTransport {
    client: reqwest::Client,
}

impl HttpModemTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn classify(e: reqwest::Error) -> TransportError {
        if e.is_timeout() || e.is_connect() {
            TransportError::retryable(format!("Modem unreachable: {}", e))
        } else {
            TransportError::retryable(format!("Modem request failed: {}", e))
        }
    }
}

#[async_trait]
impl ModemTransport for HttpModemTransport {
    async fn send_sms(
        &self,
        modem: &Modem,
        to: &str,
        text: &str,
    ) -> Result<String, TransportError> {
        let mut request = self
            .client
            .post(format!("{}/send", modem.endpoint.trim_end_matches('/')))
            .json(&serde_json::json!({ "to": to, "text": text }));

        if let Some(username) = &modem.username {
            request = request.basic_auth(username, modem.password.as_deref());
        }

        let response = request.send().await.map_err(Self::classify)?;
        let status = response.status();

        if status.is_success() {
            let body: serde_json::Value = response
                .json()
                .await
                .unwrap_or(serde_json::Value::Null);
            let message_id = body
                .get("message_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            Ok(message_id)
        } else if status.is_client_error() {
            Err(TransportError::permanent(format!(
                "Modem rejected send: HTTP {}",
                status.as_u16()
            )))
        } else {
            Err(TransportError::retryable(format!(
                "Modem error: HTTP {}",
                status.as_u16()
            )))
        }
    }

    async fn health_check(&self, modem: &Modem) -> Result<(), TransportError> {
        let mut request = self
            .client
            .get(format!("{}/status", modem.endpoint.trim_end_matches('/')));

        if let Some(username) = &modem.username {
            request = request.basic_auth(username, modem.password.as_deref());
        }

        let response = request.send().await.map_err(Self::classify)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::retryable(format!(
                "Modem status probe failed: HTTP {}",
                response.status().as_u16()
            )))
        }
    }

    async fn send_mock(
        &self,
        endpoint: &str,
        to: &str,
        text: &str,
    ) -> Result<String, TransportError> {
        let response = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({ "to": to, "text": text, "mock": true }))
            .send()
            .await
            .map_err(Self::classify)?;

        if response.status().is_success() {
            Ok(format!("mock-{}", Utc::now().timestamp_millis()))
        } else {
            Err(TransportError::retryable(format!(
                "Mock endpoint error: HTTP {}",
                response.status().as_u16()
            )))
        }
    }
}
