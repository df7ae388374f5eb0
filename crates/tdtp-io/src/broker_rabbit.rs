//! RabbitMQ client behind the core's byte-level broker interface.
//!
//! Publishes to a durable queue through the default exchange with
//! publisher confirms; consuming drains the same queue.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::debug;

use tdtp_core::broker::MessageBroker;
use tdtp_core::TdtpError;

pub struct RabbitBroker {
    uri: String,
    queue: String,
    connection: Option<Connection>,
    channel: Option<Channel>,
    consumer: Option<Consumer>,
}

impl RabbitBroker {
    pub fn new(host: &str, port: u16, user: &str, password: &str, queue: &str) -> Self {
        RabbitBroker {
            uri: format!("amqp://{user}:{password}@{host}:{port}/%2f"),
            queue: queue.to_string(),
            connection: None,
            channel: None,
            consumer: None,
        }
    }

    fn channel(&self) -> Result<&Channel, TdtpError> {
        self.channel
            .as_ref()
            .ok_or_else(|| TdtpError::Output("rabbitmq: channel used before connect".into()))
    }

    async fn ensure_consumer(&mut self) -> Result<&mut Consumer, TdtpError> {
        if self.consumer.is_none() {
            let consumer = self
                .channel()?
                .basic_consume(
                    &self.queue,
                    "tdtp-importer",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| broker_err("consume", e))?;
            self.consumer = Some(consumer);
        }
        Ok(self.consumer.as_mut().unwrap())
    }
}

#[async_trait]
impl MessageBroker for RabbitBroker {
    async fn connect(&mut self) -> Result<(), TdtpError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| broker_err("connect", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| broker_err("channel", e))?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_err("queue_declare", e))?;
        debug!(queue = %self.queue, "rabbitmq channel ready");
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TdtpError> {
        let confirm = self
            .channel()?
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| broker_err("publish", e))?;
        confirm.await.map_err(|e| broker_err("publish", e))?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>, TdtpError> {
        let consumer = self.ensure_consumer().await?;
        match consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(broker_err("receive", e)),
            Some(Ok(delivery)) => {
                let payload = delivery.data.clone();
                delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| broker_err("ack", e))?;
                Ok(Some(payload))
            }
        }
    }

    async fn close(&mut self) -> Result<(), TdtpError> {
        self.consumer = None;
        if let Some(channel) = self.channel.take() {
            let _ = channel.close(200, "bye").await;
        }
        if let Some(connection) = self.connection.take() {
            let _ = connection.close(200, "bye").await;
        }
        Ok(())
    }
}

fn broker_err(op: &str, e: impl std::fmt::Display) -> TdtpError {
    TdtpError::Output(format!("rabbitmq {op}: {e}"))
}
