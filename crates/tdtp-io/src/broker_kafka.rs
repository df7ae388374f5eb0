//! Kafka client behind the core's byte-level broker interface.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use std::time::Duration;
use tracing::debug;

use tdtp_core::broker::MessageBroker;
use tdtp_core::TdtpError;

/// Payload ceiling, sized to fit a part plus envelope overhead.
const MESSAGE_MAX_BYTES: &str = "5242880";

pub struct KafkaBroker {
    brokers: String,
    topic: String,
    group_id: String,
    producer: Option<FutureProducer>,
    consumer: Option<StreamConsumer>,
}

impl KafkaBroker {
    pub fn new(brokers: &[String], topic: &str) -> Self {
        KafkaBroker {
            brokers: brokers.join(","),
            topic: topic.to_string(),
            group_id: format!("tdtp-{topic}"),
            producer: None,
            consumer: None,
        }
    }

    pub fn with_group_id(mut self, group_id: &str) -> Self {
        self.group_id = group_id.to_string();
        self
    }

    fn ensure_consumer(&mut self) -> Result<&StreamConsumer, TdtpError> {
        if self.consumer.is_none() {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.group_id)
                .set("enable.partition.eof", "false")
                .set("session.timeout.ms", "6000")
                .set("enable.auto.commit", "true")
                .create()
                .map_err(|e| broker_err("consumer", e))?;
            consumer
                .subscribe(&[&self.topic])
                .map_err(|e| broker_err("subscribe", e))?;
            self.consumer = Some(consumer);
        }
        Ok(self.consumer.as_ref().unwrap())
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn connect(&mut self) -> Result<(), TdtpError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.max.bytes", MESSAGE_MAX_BYTES)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| broker_err("connect", e))?;
        self.producer = Some(producer);
        debug!(brokers = %self.brokers, topic = %self.topic, "kafka producer ready");
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TdtpError> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| TdtpError::Output("kafka: send before connect".into()))?;
        let record: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(&self.topic).payload(payload);
        producer
            .send(record, Duration::from_secs(30))
            .await
            .map(|_| ())
            .map_err(|(e, _)| broker_err("send", e))
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>, TdtpError> {
        let consumer = self.ensure_consumer()?;
        match consumer.recv().await {
            Ok(message) => Ok(message.payload().map(<[u8]>::to_vec)),
            Err(e) => Err(broker_err("receive", e)),
        }
    }

    async fn close(&mut self) -> Result<(), TdtpError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        self.producer = None;
        Ok(())
    }
}

fn broker_err(op: &str, e: impl std::fmt::Display) -> TdtpError {
    TdtpError::Output(format!("kafka {op}: {e}"))
}
