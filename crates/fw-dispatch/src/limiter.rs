//! Concurrency Limiter - Bounded in-flight sends per channel
//!
//! A FIFO-fair semaphore sized to the channel's `max_concurrency`,
//! independent of broker prefetch. The permit is held across the adapter
//! call and released on completion, failure, or cancellation (drop).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ChannelLimiter {
    semaphore: Arc<Semaphore>,
    capacity: u32,
    in_flight: Arc<AtomicU32>,
}

/// Held for the duration of one send; dropping releases the slot.
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicU32>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChannelLimiter {
    pub fn new(capacity: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1) as usize)),
            capacity: capacity.max(1),
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Wait for a slot. Permits are granted in FIFO order.
    pub async fn acquire(&self) -> LimiterPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        LimiterPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}
