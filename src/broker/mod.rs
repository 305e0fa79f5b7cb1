//! Broker client abstraction.
//!
//! A [`Broker`] is a reconnect-aware session with a durable-queue server.
//! Consumption is pull based: [`Broker::consume`] returns a [`Consumer`]
//! that yields one [`Delivery`] at a time, and each delivery must be settled
//! explicitly with [`Delivery::ack`] or [`Delivery::requeue`]. The client
//! never acknowledges on its own.
//!
//! Two backends are provided:
//! - [`amqp::AmqpBroker`] speaks AMQP 0-9-1 (RabbitMQ)
//! - [`memory::InMemoryBroker`] runs in-process, for tests and local runs

use bytes::Bytes;
use futures_util::{future::BoxFuture, stream::BoxStream, StreamExt};

use crate::error::Error;

pub mod amqp;
pub mod memory;

/// Number of unacknowledged deliveries a consumer may hold.
pub const PREFETCH: u16 = 1;

/// Core trait for broker sessions.
///
/// Implementations serialize their own channel use, so a single client can
/// be shared by concurrent publishers.
pub trait Broker: Send + Sync + 'static {
    /// Opens a session. Calling it on an open session is a no-op, and it can
    /// be called again after [`Broker::close`].
    fn connect(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Creates `name` as a durable, non-exclusive, non-auto-delete queue if
    /// it doesn't exist yet.
    ///
    /// Fails with [`Error::Connection`] if there is no open session.
    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Publishes `payload` to `queue` as a persistent message.
    ///
    /// Fails with [`Error::Publish`] if the channel is closed or the broker
    /// refuses the message (for instance because `queue` was never declared).
    fn publish<'a>(&'a self, queue: &'a str, payload: Bytes) -> BoxFuture<'a, Result<(), Error>>;

    /// Registers a consumer on `queue` with a prefetch of [`PREFETCH`].
    fn consume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Consumer, Error>>;

    /// Releases the session. Safe to call when already closed.
    fn close(&self) -> BoxFuture<'_, Result<(), Error>>;
}

/// Settles a single delivery with the broker.
pub trait Acknowledge: Send + 'static {
    /// The message was handled and may be removed from the queue.
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), Error>>;

    /// The message was not handled and should be delivered again.
    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), Error>>;
}

/// A message handed to a consumer.
pub struct Delivery {
    body: Bytes,
    redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(body: impl Into<Bytes>, redelivered: bool, acker: impl Acknowledge) -> Self {
        Self {
            body: body.into(),
            redelivered,
            acker: Box::new(acker),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker has handed this message out before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<(), Error> {
        self.acker.ack().await
    }

    pub async fn requeue(self) -> Result<(), Error> {
        self.acker.requeue().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Pull side of a consume registration.
pub struct Consumer {
    deliveries: BoxStream<'static, Result<Delivery, Error>>,
}

impl Consumer {
    pub fn new(deliveries: BoxStream<'static, Result<Delivery, Error>>) -> Self {
        Self { deliveries }
    }

    /// Waits for the next delivery. `None` means the broker ended the
    /// consumer, usually because the session was closed.
    pub async fn next(&mut self) -> Option<Result<Delivery, Error>> {
        self.deliveries.next().await
    }
}
