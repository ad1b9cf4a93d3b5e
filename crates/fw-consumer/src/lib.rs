//! FleetWatch Consumer
//!
//! Provides:
//! - `AlarmConsumer` - the AMQP consumer with prefetch, pause gate, bounded
//!   retry-republish, and reconnect backoff
//! - Payload normalization for the two producer formats
//! - `SystemStateGate` - cached pause/resume + mock-mode selection
//! - `WorkerRegistry` - liveness heartbeat and stale-worker reaping

mod consumer;
mod payload;
mod system_state;
mod worker_registry;

pub use consumer::{retry_action, retry_count_from, AlarmConsumer, RetryAction};
pub use payload::{parse_alarm_payload, salvage_identity, AlarmPayload, PayloadError};
pub use system_state::SystemStateGate;
pub use worker_registry::WorkerRegistry;
