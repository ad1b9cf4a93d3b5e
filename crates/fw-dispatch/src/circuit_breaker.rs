//! Circuit Breaker - Per-channel failure isolation
//!
//! CLOSED -> OPEN after `failure_threshold` consecutive failures;
//! OPEN -> HALF_OPEN once `open_timeout` has elapsed; HALF_OPEN admits a
//! single probe at a time and closes after `success_threshold` probe
//! successes. Breakers are process-local; each consumer instance has its
//! own set.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use fw_common::{error_type, Channel};
use fw_config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why a call was refused without executing. Never retried locally; the
/// breaker's own timer is the backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRejection {
    #[error("CIRCUIT_BREAKER_OPEN")]
    Open,
    #[error("CIRCUIT_BREAKER_HALF_OPEN_BUSY")]
    HalfOpenBusy,
}

impl BreakerRejection {
    pub fn error_type(&self) -> &'static str {
        match self {
            BreakerRejection::Open => error_type::CIRCUIT_BREAKER_OPEN,
            BreakerRejection::HalfOpenBusy => error_type::CIRCUIT_BREAKER_HALF_OPEN_BUSY,
        }
    }
}

/// Circuit breaker for one channel
pub struct CircuitBreaker {
    name: &'static str,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    /// HALF_OPEN admits one probe at a time; cleared by record_*.
    probe_in_flight: AtomicBool,

    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(
        name: &'static str,
        failure_threshold: u32,
        success_threshold: u32,
        open_timeout: Duration,
    ) -> Self {
        Self {
            name,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            probe_in_flight: AtomicBool::new(false),
            failure_threshold,
            success_threshold,
            open_timeout,
        }
    }

    /// Gate a call. `Ok(())` means the caller may execute (and must report
    /// the outcome via `record_success` / `record_failure`).
    pub fn try_acquire(&self) -> Result<(), BreakerRejection> {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = self.opened_at.read().map(|at| at.elapsed());
                if matches!(elapsed, Some(e) if e >= self.open_timeout) {
                    let mut state = self.state.write();
                    // Double-check under the write lock
                    if *state == CircuitState::Open {
                        *state = CircuitState::HalfOpen;
                        self.success_count.store(0, Ordering::SeqCst);
                        self.probe_in_flight.store(false, Ordering::SeqCst);
                        debug!(breaker = self.name, "Circuit breaker half-open");
                    }
                    drop(state);
                    self.claim_probe()
                } else {
                    Err(BreakerRejection::Open)
                }
            }
            CircuitState::HalfOpen => self.claim_probe(),
        }
    }

    fn claim_probe(&self) -> Result<(), BreakerRejection> {
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(())
        } else {
            Err(BreakerRejection::HalfOpenBusy)
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::HalfOpen => {
                self.probe_in_flight.store(false, Ordering::SeqCst);
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.success_threshold {
                    *self.state.write() = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::SeqCst);
                    *self.opened_at.write() = None;
                    info!(breaker = self.name, successes = count, "Circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.opened_at.write() = Some(Instant::now());
                    warn!(breaker = self.name, failures = count, "Circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure re-opens and restarts the timer
                *self.state.write() = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                self.probe_in_flight.store(false, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
                warn!(breaker = self.name, "Circuit breaker re-opened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    /// Force CLOSED, clearing all counters.
    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        *self.opened_at.write() = None;
        self.probe_in_flight.store(false, Ordering::SeqCst);
        info!(breaker = self.name, "Circuit breaker reset");
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }
}

/// The per-channel breaker set owned by one processor instance.
pub struct ChannelBreakers {
    breakers: HashMap<Channel, Arc<CircuitBreaker>>,
}

impl ChannelBreakers {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        let open_timeout = Duration::from_secs(config.open_timeout_seconds);
        let mut breakers = HashMap::new();
        for channel in Channel::ALL {
            breakers.insert(
                channel,
                Arc::new(CircuitBreaker::new(
                    channel.as_str(),
                    config.failure_threshold,
                    config.success_threshold,
                    open_timeout,
                )),
            );
        }
        Self { breakers }
    }

    pub fn get(&self, channel: Channel) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breakers[&channel])
    }

    pub fn is_closed(&self, channel: Channel) -> bool {
        self.breakers[&channel].state() == CircuitState::Closed
    }

    pub fn all_closed(&self) -> bool {
        Channel::ALL.iter().all(|c| self.is_closed(*c))
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new("test", 3, 2, open_timeout)
    }

    #[test]
    fn trips_after_failure_threshold() {
        let cb = breaker(Duration::from_secs(30));

        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire(), Err(BreakerRejection::Open));
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = breaker(Duration::from_secs(30));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let cb = breaker(Duration::from_millis(0));

        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Timer elapsed (zero timeout): first caller becomes the probe
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Concurrent caller is refused distinctly
        assert_eq!(cb.try_acquire(), Err(BreakerRejection::HalfOpenBusy));

        // Probe succeeds; next probe allowed
        cb.record_success();
        assert!(cb.try_acquire().is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(Duration::from_millis(0));

        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_timeout() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.try_acquire(), Err(BreakerRejection::Open));
        assert_eq!(cb.try_acquire(), Err(BreakerRejection::Open));
    }

    #[test]
    fn reset_forces_closed() {
        let cb = breaker(Duration::from_secs(60));
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn registry_tracks_all_channels() {
        let breakers = ChannelBreakers::new(&CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_timeout_seconds: 60,
        });
        assert!(breakers.all_closed());

        breakers.get(Channel::Email).record_failure();
        assert!(!breakers.is_closed(Channel::Email));
        assert!(breakers.is_closed(Channel::Sms));
        assert!(!breakers.all_closed());

        breakers.reset_all();
        assert!(breakers.all_closed());
    }

    #[test]
    fn rejection_error_types() {
        assert_eq!(
            BreakerRejection::Open.error_type(),
            error_type::CIRCUIT_BREAKER_OPEN
        );
        assert_eq!(
            BreakerRejection::HalfOpenBusy.error_type(),
            error_type::CIRCUIT_BREAKER_HALF_OPEN_BUSY
        );
    }
}
