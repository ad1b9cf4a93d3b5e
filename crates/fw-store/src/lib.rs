//! FleetWatch Persistence Layer
//!
//! Provides the `AlarmStore` trait over everything the notification engine
//! persists: alarms, contacts, dedup records, the notification audit log,
//! the dead-letter queue, the modem fleet, system state, feature flags, and
//! the worker registry.
//!
//! Two implementations:
//! - `PostgresAlarmStore` - production backend (sqlx)
//! - `InMemoryAlarmStore` - tests and drills

mod memory;
mod notify;
mod postgres;
mod repository;

pub use memory::InMemoryAlarmStore;
pub use notify::spawn_alarm_created_listener;
pub use postgres::PostgresAlarmStore;
pub use repository::{AlarmStore, NewDlqItem, WorkerCleanup};
