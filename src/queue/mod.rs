//! AMQP 0.9.1 queue client wrapper around `lapin`.
//!
//! Two durable queues drive the pipeline: `raw_logs` (ingester → Parser
//! Worker) and `features` (Parser Worker → Detector Worker). Connections
//! reconnect with exponential backoff from 5s to 60s, doubling on each
//! failed attempt and resetting to the floor on success.

use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

const MIN_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A durable AMQP queue connection, auto-reconnecting with exponential
/// backoff and resetting the backoff after each successful connection.
pub struct QueueClient {
    uri: String,
    connection: Option<Connection>,
    channel: Option<Channel>,
    backoff: Duration,
}

impl QueueClient {
    pub fn new(uri: String) -> Self {
        Self {
            uri,
            connection: None,
            channel: None,
            backoff: MIN_BACKOFF,
        }
    }

    /// Connect (or reconnect) to the broker, retrying forever with
    /// exponential backoff. Declares `queue_name` durable and sets
    /// prefetch=1 on the channel.
    pub async fn connect(&mut self, queue_name: &str) -> Result<()> {
        loop {
            match self.try_connect(queue_name).await {
                Ok(()) => {
                    self.backoff = MIN_BACKOFF;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_secs = self.backoff.as_secs(),
                        "queue connection failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn try_connect(&mut self, queue_name: &str) -> Result<()> {
        let connection =
            Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await?;

        info!(queue = queue_name, "connected to AMQP broker");
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel
            .as_ref()
            .ok_or_else(|| PipelineError::internal("queue channel not connected"))
    }

    /// Publish a persistent-delivery JSON message to `queue_name`.
    pub async fn publish(&self, queue_name: &str, body: &[u8]) -> Result<()> {
        self.channel()?
            .basic_publish(
                "",
                queue_name,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Begin consuming `queue_name`, returning a stream of deliveries. The
    /// caller acks/nacks each delivery explicitly (ack-after-
    /// persist contract).
    pub async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
    ) -> Result<lapin::Consumer> {
        let consumer = self
            .channel()?
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Pull a single message without blocking for a consumer tag, for the
    /// manual-drain `process_one` / `process_all_pending` operations
    /// for manual queue draining.
    pub async fn get_one(&self, queue_name: &str) -> Result<Option<lapin::message::BasicGetMessage>> {
        let message = self
            .channel()?
            .basic_get(queue_name, BasicGetOptions::default())
            .await?;
        Ok(message)
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel()?
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Passive `queue_declare` for introspection, backing `GET /queue/info`
    /// message/consumer counts without side effects.
    pub async fn queue_info(&self, queue_name: &str) -> Result<QueueInfo> {
        let declared = self
            .channel()?
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(QueueInfo {
            queue: queue_name.to_string(),
            messages: declared.message_count(),
            consumers: declared.consumer_count(),
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueInfo {
    pub queue: String,
    pub messages: u32,
    pub consumers: u32,
}

/// Drains the next delivery from a consumer stream, if any is already
/// buffered; used by worker loops that interleave queue I/O with shutdown
/// signal checks.
pub async fn next_delivery(
    consumer: &mut lapin::Consumer,
) -> Option<std::result::Result<lapin::message::Delivery, lapin::Error>> {
    consumer.next().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = MIN_BACKOFF;
        let mut steps = vec![backoff];
        for _ in 0..6 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
            steps.push(backoff);
        }
        assert_eq!(steps.last().copied().unwrap(), MAX_BACKOFF);
        assert_eq!(steps[0], Duration::from_secs(5));
    }
}
