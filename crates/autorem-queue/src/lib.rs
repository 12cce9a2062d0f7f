//! AMQP incident ingestion.
//!
//! Incidents are published by the alerting platform to a direct exchange;
//! the consumer binds a transient exclusive queue and forwards decoded
//! incidents to the pipeline over an in-process channel. Deliveries are
//! acknowledged as soon as they decode, so processing is at-most-once
//! after the ack.

use anyhow::{Context, Result};
use async_trait::async_trait;
use autorem_common::types::Incident;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::mpsc;

const EXCHANGE_NAME: &str = "alerts";

/// Handle over the incident subscription, kept for shutdown.
#[async_trait]
pub trait IncidentQueue: Send + Sync {
    /// Starts forwarding decoded incidents to `sink`. May be called once.
    fn register(&mut self, sink: mpsc::Sender<Incident>);

    /// Cancels the consumer and closes the connection.
    async fn shutdown(&self) -> Result<()>;
}

pub struct AmqpQueue {
    name: String,
    conn: Connection,
    consumer: Option<Consumer>,
    consumer_tag: String,
    channel: lapin::Channel,
}

impl AmqpQueue {
    /// Dials the broker, declares the exchange and a transient exclusive
    /// queue bound under `name`, and opens the consumer. Forwarding starts
    /// when [`IncidentQueue::register`] is called.
    pub async fn connect(name: &str, addr: &str, user: &str, pass: &str) -> Result<AmqpQueue> {
        let uri = format!("amqp://{user}:{pass}@{addr}");
        let conn = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .context("error dialing amqp server")?;
        let channel = conn
            .create_channel()
            .await
            .context("error getting amqp channel")?;

        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("error declaring exchange")?;

        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .context("error declaring queue")?;

        channel
            .queue_bind(
                queue.name().as_str(),
                EXCHANGE_NAME,
                name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("error binding queue")?;

        let consumer = channel
            .basic_consume(
                name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to start consumer")?;
        let consumer_tag = consumer.tag().to_string();

        tracing::info!(addr, queue = name, "connected to AMQP server");
        Ok(AmqpQueue {
            name: name.to_string(),
            conn,
            consumer: Some(consumer),
            consumer_tag,
            channel,
        })
    }
}

#[async_trait]
impl IncidentQueue for AmqpQueue {
    fn register(&mut self, sink: mpsc::Sender<Incident>) {
        let Some(mut consumer) = self.consumer.take() else {
            tracing::warn!(queue = %self.name, "incident queue already registered");
            return;
        };
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::error!(error = %e, "amqp consumer failed, stopping ingestion");
                        return;
                    }
                };
                let incident = match decode_incident(&delivery.data) {
                    Ok(incident) => incident,
                    Err(e) => {
                        tracing::error!(error = %e, "error decoding incident");
                        continue;
                    }
                };
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    tracing::error!(error = %e, "failed to ack delivery");
                }
                if sink.send(incident).await.is_err() {
                    tracing::info!("incident channel closed, stopping ingestion");
                    return;
                }
            }
            tracing::info!("amqp delivery stream ended");
        });
    }

    async fn shutdown(&self) -> Result<()> {
        self.channel
            .basic_cancel(
                &self.consumer_tag,
                lapin::options::BasicCancelOptions::default(),
            )
            .await
            .context("consumer cancel failed")?;
        self.conn
            .close(0, "shutdown")
            .await
            .context("amqp connection close error")?;
        Ok(())
    }
}

pub(crate) fn decode_incident(body: &[u8]) -> Result<Incident> {
    serde_json::from_slice(body).context("invalid incident payload")
}
