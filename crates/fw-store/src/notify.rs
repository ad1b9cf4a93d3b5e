//! `alarm_created` NOTIFY listener
//!
//! The platform raises a Postgres NOTIFY on the `alarm_created` channel for
//! every inserted alarm, carrying `{alarm_id, imei, status, is_sms,
//! is_email}`. The listener is optional monitoring only; delivery runs off
//! the AMQP queue, never off this signal.

use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANNEL: &str = "alarm_created";

#[derive(Debug, Deserialize)]
struct AlarmCreatedEvent {
    alarm_id: i64,
    imei: String,
    status: String,
    #[serde(default)]
    is_sms: bool,
    #[serde(default)]
    is_email: bool,
}

/// Spawn the listener task. Exits on shutdown; a dropped connection ends the
/// task with a warning rather than tearing the service down.
pub fn spawn_alarm_created_listener(
    pool: PgPool,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Could not open alarm_created listener");
                return;
            }
        };
        if let Err(e) = listener.listen(CHANNEL).await {
            warn!(error = %e, "Could not LISTEN on alarm_created");
            return;
        }
        info!("Listening for alarm_created notifications");

        loop {
            tokio::select! {
                notification = listener.recv() => {
                    match notification {
                        Ok(n) => match serde_json::from_str::<AlarmCreatedEvent>(n.payload()) {
                            Ok(event) => {
                                debug!(
                                    alarm_id = event.alarm_id,
                                    imei = %event.imei,
                                    status = %event.status,
                                    is_sms = event.is_sms,
                                    is_email = event.is_email,
                                    "Alarm created upstream"
                                );
                            }
                            Err(e) => {
                                warn!(error = %e, payload = %n.payload(), "Malformed alarm_created payload");
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "alarm_created listener connection lost");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("alarm_created listener shutting down");
                    break;
                }
            }
        }
    })
}
