//! AMQP Alarm Consumer
//!
//! Consumes alarm events from the durable priority queue:
//! - Topology asserted on every (re)connect: topic exchange, priority/TTL/
//!   length-limited lazy queue with a dead-letter exchange, sibling DLQ
//! - Prefetch bounds concurrent deliveries; each delivery is processed in
//!   its own task and acked only on completion
//! - Paused system state nack-requeues with a short hold
//! - Processing failures republish with an incremented `x-retry-count`
//!   header up to 3 times, then dead-letter to the broker DLX
//! - Connection loss reconnects with exponential backoff capped at 60s

use dashmap::DashSet;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel as AmqpChannel, Connection, ConnectionProperties,
    Consumer as LapinConsumer, ExchangeKind,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::payload::{parse_alarm_payload, salvage_identity};
use crate::system_state::SystemStateGate;
use fw_common::{error_type, logging, Channel};
use fw_config::AmqpConfig;
use fw_dispatch::{metrics, AlarmProcessor};
use fw_store::{AlarmStore, NewDlqItem};

/// Broker-level redelivery budget before a message goes to the DLX.
const MAX_MESSAGE_RETRIES: i32 = 3;
/// Minimum spacing between pause-gate log lines.
const PAUSE_LOG_INTERVAL: Duration = Duration::from_secs(30);
/// Hold time on a paused message before the requeueing nack.
const PAUSE_REQUEUE_HOLD: Duration = Duration::from_secs(5);
/// Bounded drain on graceful shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

enum LoopExit {
    Shutdown,
    Reconnect,
}

/// What to do with a message whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Ack the original and republish with this retry count.
    Republish(i32),
    /// Nack without requeue; the broker routes to its DLX.
    DeadLetter,
}

/// Pure retry decision, split out for tests.
pub fn retry_action(retry_count: i32) -> RetryAction {
    if retry_count < MAX_MESSAGE_RETRIES {
        RetryAction::Republish(retry_count + 1)
    } else {
        RetryAction::DeadLetter
    }
}

/// Read `x-retry-count` from message headers, tolerating integer widths.
pub fn retry_count_from(properties: &BasicProperties) -> i32 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "x-retry-count")
                .map(|(_, value)| value)
        })
        .and_then(|value| match value {
            AMQPValue::LongInt(n) => Some(*n),
            AMQPValue::LongLongInt(n) => Some(*n as i32),
            AMQPValue::ShortInt(n) => Some(*n as i32),
            AMQPValue::ShortShortInt(n) => Some(*n as i32),
            _ => None,
        })
        .unwrap_or(0)
}

pub struct AlarmConsumer {
    config: AmqpConfig,
    store: Arc<dyn AlarmStore>,
    processor: Arc<AlarmProcessor>,
    gate: Arc<SystemStateGate>,
    /// Unique message ids held back by the pause gate, for observability.
    paused_ids: DashSet<String>,
    last_pause_log: Mutex<Option<Instant>>,
    running: AtomicBool,
}

impl AlarmConsumer {
    pub fn new(
        config: AmqpConfig,
        store: Arc<dyn AlarmStore>,
        processor: Arc<AlarmProcessor>,
        gate: Arc<SystemStateGate>,
    ) -> Self {
        Self {
            config,
            store,
            processor,
            gate,
            paused_ids: DashSet::new(),
            last_pause_log: Mutex::new(None),
            running: AtomicBool::new(true),
        }
    }

    pub fn paused_message_count(&self) -> usize {
        self.paused_ids.len()
    }

    /// Consume until shutdown, reconnecting on connection loss.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut consecutive_failures: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            match self.connect().await {
                Ok((connection, channel, consumer)) => {
                    consecutive_failures = 0;
                    let monitor = self.spawn_queue_monitor(channel.clone());

                    let exit = Arc::clone(&self)
                        .consume_loop(&channel, consumer, &mut shutdown_rx)
                        .await;
                    monitor.abort();

                    let _ = channel.close(200, "Consumer loop ended").await;
                    let _ = connection.close(200, "Consumer loop ended").await;

                    if matches!(exit, LoopExit::Shutdown) {
                        break;
                    }
                    warn!("Consumer disconnected, reconnecting");
                }
                Err(e) => {
                    consecutive_failures += 1;
                    metrics::record_consumer_error("connect");

                    let delay = if consecutive_failures >= self.config.max_reconnect_attempts {
                        warn!(
                            attempts = consecutive_failures,
                            "Reconnect attempts exhausted, cooling off and resetting"
                        );
                        consecutive_failures = 0;
                        Duration::from_secs(60)
                    } else {
                        let base = self.config.reconnect_delay_seconds.max(1);
                        Duration::from_secs(
                            (base * 2u64.saturating_pow(consecutive_failures - 1)).min(60),
                        )
                    };

                    error!(
                        error = %e,
                        attempt = consecutive_failures,
                        delay_secs = delay.as_secs(),
                        "AMQP connection failed"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }

        info!("Alarm consumer stopped");
    }

    /// Connect, assert topology, set QoS, open the consumer stream.
    async fn connect(
        &self,
    ) -> anyhow::Result<(Connection, AmqpChannel, LapinConsumer)> {
        info!(uri = %self.config.url, queue = %self.config.queue, "Connecting to AMQP broker");

        let connection = Connection::connect(
            &self.config.url,
            ConnectionProperties::default().with_connection_name("fleetwatch-notifier".into()),
        )
        .await?;

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        self.declare_topology(&channel).await?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &format!("fw-consumer-{}", uuid::Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.config.queue, prefetch = self.config.prefetch, "Connected to AMQP broker");
        Ok((connection, channel, consumer))
    }

    /// Re-assert exchange, queues, and bindings; idempotent on the broker.
    async fn declare_topology(&self, channel: &AmqpChannel) -> anyhow::Result<()> {
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .exchange_declare(
                &self.config.dead_letter_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // Broker-level DLQ for expired/rejected messages
        let mut dlq_args = FieldTable::default();
        dlq_args.insert("x-message-ttl".into(), AMQPValue::LongInt(604_800_000));
        dlq_args.insert("x-max-length".into(), AMQPValue::LongInt(10_000));
        channel
            .queue_declare(
                &self.config.dead_letter_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                dlq_args,
            )
            .await?;
        channel
            .queue_bind(
                &self.config.dead_letter_queue,
                &self.config.dead_letter_exchange,
                &self.config.dead_letter_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Main queue: priority-enabled, TTL- and length-bounded, lazy
        let mut queue_args = FieldTable::default();
        queue_args.insert("x-max-priority".into(), AMQPValue::LongInt(10));
        queue_args.insert("x-message-ttl".into(), AMQPValue::LongInt(86_400_000));
        queue_args.insert("x-max-length".into(), AMQPValue::LongInt(50_000));
        queue_args.insert("x-queue-mode".into(), AMQPValue::LongString("lazy".into()));
        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.config.dead_letter_exchange.as_str().into()),
        );
        queue_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.config.dead_letter_routing_key.as_str().into()),
        );
        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_args,
            )
            .await?;
        channel
            .queue_bind(
                &self.config.queue,
                &self.config.exchange,
                &self.config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(
            exchange = %self.config.exchange,
            queue = %self.config.queue,
            routing_key = %self.config.routing_key,
            "AMQP topology asserted"
        );
        Ok(())
    }

    /// Dispatch deliveries into per-message tasks until disconnect or
    /// shutdown; drains in-flight tasks (bounded) before returning.
    async fn consume_loop(
        self: Arc<Self>,
        channel: &AmqpChannel,
        mut consumer: LapinConsumer,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> LoopExit {
        let consumer_tag = consumer.tag().clone();
        let mut tasks: JoinSet<()> = JoinSet::new();

        let exit = loop {
            tokio::select! {
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let this = Arc::clone(&self);
                        let channel = channel.clone();
                        tasks.spawn(async move {
                            this.handle_delivery(channel, delivery).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Error receiving delivery");
                        metrics::record_consumer_error("receive");
                        break LoopExit::Reconnect;
                    }
                    None => {
                        warn!("Consumer stream ended");
                        break LoopExit::Reconnect;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested, cancelling subscription");
                    let _ = channel
                        .basic_cancel(consumer_tag.as_str(), BasicCancelOptions::default())
                        .await;
                    break LoopExit::Shutdown;
                }
            }
        };

        // Drain in-flight processing before the channel goes away
        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Draining in-flight deliveries");
            let drain = async {
                while tasks.join_next().await.is_some() {}
            };
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                warn!("Drain timeout reached, aborting remaining tasks");
                tasks.abort_all();
            }
        }

        exit
    }

    /// One delivery: pause gate, parse, process, ack/republish/dead-letter.
    async fn handle_delivery(&self, channel: AmqpChannel, delivery: lapin::message::Delivery) {
        // Pause gate: hold briefly, then requeue
        if self.gate.is_paused() {
            self.note_paused(&delivery);
            tokio::time::sleep(PAUSE_REQUEUE_HOLD).await;
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                warn!(error = %e, "Nack of paused message failed");
            }
            return;
        }
        if !self.paused_ids.is_empty() {
            // Resume observed: the held-back set starts over
            self.paused_ids.clear();
        }

        let alarm = match parse_alarm_payload(&delivery.data) {
            Ok(alarm) => alarm,
            Err(e) => {
                warn!(error = %e, "Unparseable alarm payload");
                metrics::record_consumer_error("parse");
                self.reject_malformed(&delivery, &e.to_string()).await;
                return;
            }
        };

        let alarm_id = alarm.id;
        let imei = alarm.imei.clone();
        let result = self
            .processor
            .process_alarm(alarm)
            .instrument(logging::alarm_span(alarm_id, &imei))
            .await;
        match result {
            Ok(report) => {
                debug!(alarm_id = alarm_id, outcome = ?report.outcome, "Alarm processed");
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!(alarm_id = alarm_id, error = %e, "Ack failed");
                }
            }
            Err(e) => {
                warn!(alarm_id = alarm_id, error = %e, "Alarm processing failed");
                metrics::record_consumer_error("process");

                match retry_action(retry_count_from(&delivery.properties)) {
                    RetryAction::Republish(next_count) => {
                        match self.republish(&channel, &delivery, next_count).await {
                            Ok(()) => {
                                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                    warn!(alarm_id = alarm_id, error = %e, "Ack after republish failed");
                                }
                            }
                            Err(e) => {
                                // Keep the original if the republish failed
                                warn!(alarm_id = alarm_id, error = %e, "Republish failed, requeueing original");
                                let _ = delivery
                                    .nack(BasicNackOptions {
                                        requeue: true,
                                        ..Default::default()
                                    })
                                    .await;
                            }
                        }
                    }
                    RetryAction::DeadLetter => {
                        info!(alarm_id = alarm_id, "Message retries exhausted, dead-lettering");
                        let _ = delivery
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..Default::default()
                            })
                            .await;
                    }
                }
            }
        }
    }

    /// Track the unique paused message and log with rate limiting.
    fn note_paused(&self, delivery: &lapin::message::Delivery) {
        let key = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .or_else(|| salvage_identity(&delivery.data).map(|(id, _)| id.to_string()))
            .unwrap_or_else(|| delivery.delivery_tag.to_string());

        if self.paused_ids.insert(key) {
            metrics::record_paused_message();
        }

        let mut last_log = self.last_pause_log.lock();
        let should_log = last_log
            .map(|at| at.elapsed() >= PAUSE_LOG_INTERVAL)
            .unwrap_or(true);
        if should_log {
            info!(
                held_back = self.paused_ids.len(),
                "System paused, requeueing deliveries"
            );
            *last_log = Some(Instant::now());
        }
    }

    /// Park a salvageable malformed payload in the database DLQ and ack;
    /// otherwise reject to the broker DLX.
    async fn reject_malformed(&self, delivery: &lapin::message::Delivery, reason: &str) {
        if let Some((alarm_id, imei)) = salvage_identity(&delivery.data) {
            let payload = serde_json::from_slice(&delivery.data)
                .unwrap_or(serde_json::Value::Null);
            let item = NewDlqItem {
                alarm_id,
                imei,
                channel: Channel::Email,
                payload,
                error_message: reason.to_string(),
                error_type: error_type::VALIDATION_ERROR.to_string(),
                attempts: 0,
            };
            if let Err(e) = self.store.insert_dlq_item(item).await {
                warn!(alarm_id = alarm_id, error = %e, "Could not park malformed payload");
            }
            let _ = delivery.ack(BasicAckOptions::default()).await;
        } else {
            let _ = delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await;
        }
    }

    /// Republish the message content with an incremented retry header at
    /// the original priority.
    async fn republish(
        &self,
        channel: &AmqpChannel,
        delivery: &lapin::message::Delivery,
        retry_count: i32,
    ) -> anyhow::Result<()> {
        let mut headers = delivery
            .properties
            .headers()
            .clone()
            .unwrap_or_default();
        headers.insert("x-retry-count".into(), AMQPValue::LongInt(retry_count));

        let priority = (*delivery.properties.priority()).unwrap_or(5);
        let properties = BasicProperties::default()
            .with_priority(priority)
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_headers(headers);

        channel
            .basic_publish(
                &self.config.exchange,
                &self.config.routing_key,
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await?
            .await?;

        debug!(retry_count = retry_count, "Message republished for retry");
        Ok(())
    }

    /// Sample queue depth on an interval; above the backpressure threshold
    /// only a counter moves (prefetch is the actual throttle).
    fn spawn_queue_monitor(&self, channel: AmqpChannel) -> tokio::task::JoinHandle<()> {
        let queue = self.config.queue.clone();
        let threshold = self.config.backpressure_threshold;
        let interval =
            Duration::from_secs(self.config.queue_monitor_interval_seconds.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match channel
                    .queue_declare(
                        &queue,
                        QueueDeclareOptions {
                            passive: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                {
                    Ok(state) => {
                        let depth = state.message_count();
                        metrics::set_queue_depth(depth);
                        if depth > threshold {
                            metrics::record_backpressure(depth);
                            debug!(depth = depth, threshold = threshold, "Queue depth above backpressure threshold");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Queue depth sample failed, monitor exiting");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the run loop (used alongside the shutdown broadcast).
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
