//! AMQP 0-9-1 implementation of the broker client, for RabbitMQ.
//!
//! Queues are declared durable and messages are published with delivery
//! mode 2 (persistent). The channel runs in publisher-confirm mode and
//! publishes are `mandatory`, so a message that can't be routed to a queue
//! comes back as an error instead of being dropped silently.

use bytes::Bytes;
use futures_util::{future::BoxFuture, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::error::Error;

use super::{Acknowledge, Broker, Consumer, Delivery, PREFETCH};

const PERSISTENT: u8 = 2;

struct Session {
    connection: Connection,
    channel: Channel,
}

/// Broker client backed by a single AMQP connection and channel.
///
/// The session sits behind a mutex, so publishes from concurrent callers
/// are serialized onto the one channel.
pub struct AmqpBroker {
    uri: SecretString,
    session: Mutex<Option<Session>>,
}

impl AmqpBroker {
    pub fn new(uri: SecretString) -> Self {
        Self {
            uri,
            session: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<Session, Error> {
        let connection =
            Connection::connect(self.uri.expose_secret(), ConnectionProperties::default())
                .await
                .map_err(Error::connection)?;

        let channel = Self::open_channel(&connection).await?;

        Ok(Session {
            connection,
            channel,
        })
    }

    async fn open_channel(connection: &Connection) -> Result<Channel, Error> {
        let channel = connection
            .create_channel()
            .await
            .map_err(Error::connection)?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(Error::connection)?;

        Ok(channel)
    }

    /// The open channel, or `None` if there is no usable session.
    async fn channel(&self) -> Option<Channel> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| s.channel.status().connected())
            .map(|s| s.channel.clone())
    }
}

impl Broker for AmqpBroker {
    fn connect(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut session = self.session.lock().await;

            if let Some(existing) = session.as_mut() {
                if existing.channel.status().connected() {
                    return Ok(());
                }

                // The broker can close a channel and keep the connection.
                if existing.connection.status().connected() {
                    existing.channel = Self::open_channel(&existing.connection).await?;
                    tracing::info!("Reopened AMQP channel");
                    return Ok(());
                }
            }

            *session = Some(self.open().await?);

            tracing::info!("Connected to AMQP broker");

            Ok(())
        })
    }

    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let channel = self.channel().await.ok_or_else(Error::not_connected)?;

            channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(Error::connection)?;

            tracing::debug!(queue = name, "Queue declared");

            Ok(())
        })
    }

    fn publish<'a>(&'a self, queue: &'a str, payload: Bytes) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            // Held for the whole publish so confirms can't interleave.
            let session = self.session.lock().await;

            let channel = match session.as_ref() {
                Some(s) if s.channel.status().connected() => &s.channel,
                _ => return Err(Error::publish(queue, "channel closed")),
            };

            let confirmation = channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    &payload,
                    BasicProperties::default()
                        .with_delivery_mode(PERSISTENT)
                        .with_content_type("application/json".into()),
                )
                .await
                .map_err(|e| Error::publish(queue, e))?
                .await
                .map_err(|e| Error::publish(queue, e))?;

            match confirmation {
                Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
                Confirmation::Ack(Some(returned)) => Err(Error::publish(
                    queue,
                    format!("returned by broker: {}", returned.reply_text.as_str()),
                )),
                Confirmation::Nack(_) => Err(Error::publish(queue, "rejected by broker")),
            }
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Consumer, Error>> {
        Box::pin(async move {
            let channel = self.channel().await.ok_or_else(Error::not_connected)?;

            channel
                .basic_qos(PREFETCH, BasicQosOptions::default())
                .await
                .map_err(Error::connection)?;

            let consumer = channel
                .basic_consume(
                    queue,
                    &format!("courier-{}", std::process::id()),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(Error::connection)?;

            let deliveries = consumer
                .map(|res| {
                    res.map(|d| Delivery::new(d.data, d.redelivered, d.acker))
                        .map_err(Error::connection)
                })
                .boxed();

            Ok(Consumer::new(deliveries))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let Some(session) = self.session.lock().await.take() else {
                return Ok(());
            };

            if session.channel.status().connected() {
                if let Err(e) = session.channel.close(200, "closing").await {
                    tracing::warn!("Failed to close channel: {e}");
                }
            }

            if session.connection.status().connected() {
                session
                    .connection
                    .close(200, "closing")
                    .await
                    .map_err(Error::connection)?;
            }

            Ok(())
        })
    }
}

impl Acknowledge for Acker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin(async move {
            Acker::ack(&self, BasicAckOptions::default())
                .await
                .map_err(Error::connection)
        })
    }

    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin(async move {
            Acker::nack(
                &self,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::connection)
        })
    }
}
