//! In-process implementation of the broker client.
//!
//! [`InMemoryServer`] plays the part of the broker process: it owns the named
//! queues, which outlive any client session. [`InMemoryBroker`] is a client
//! with its own session, so a producer and a worker can connect, close and
//! reconnect independently while sharing the same queues.
//!
//! Delivery follows the same rules as the AMQP backend: each consumer holds
//! at most one unsettled delivery, and a delivery dropped without being
//! settled goes back to the front of its queue marked as redelivered.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, stream, StreamExt};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::{Acknowledge, Broker, Consumer, Delivery, PREFETCH};

struct Entry {
    body: Bytes,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    pending: Mutex<VecDeque<Entry>>,
    ready: Notify,
}

impl QueueState {
    fn push_back(&self, entry: Entry) {
        self.lock().push_back(entry);
        self.ready.notify_one();
    }

    fn push_front(&self, entry: Entry) {
        self.lock().push_front(entry);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<Entry> {
        self.lock().pop_front()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry>> {
        // A poisoned queue still holds valid entries.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared queue storage. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryServer {
    queues: Arc<papaya::HashMap<String, Arc<QueueState>>>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client for this server, not yet connected.
    pub fn client(&self) -> InMemoryBroker {
        InMemoryBroker {
            server: self.clone(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.queues.pin().get(name).cloned()
    }

    fn declare(&self, name: &str) {
        self.queues
            .pin()
            .get_or_insert_with(name.to_owned(), || Arc::new(QueueState::default()));
    }

    /// Bodies waiting in `queue`, oldest first. Unsettled deliveries are
    /// not included.
    pub fn pending(&self, queue: &str) -> Vec<Bytes> {
        self.queue(queue)
            .map(|q| q.lock().iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }
}

/// Client session against an [`InMemoryServer`].
#[derive(Clone)]
pub struct InMemoryBroker {
    server: InMemoryServer,
    session: Arc<Mutex<Option<CancellationToken>>>,
}

impl InMemoryBroker {
    /// Token of the open session, if any.
    fn session(&self) -> Option<CancellationToken> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Broker for InMemoryBroker {
    fn connect(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_or_insert_with(CancellationToken::new);
            Ok(())
        })
    }

    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.session().ok_or_else(Error::not_connected)?;
            self.server.declare(name);
            Ok(())
        })
    }

    fn publish<'a>(&'a self, queue: &'a str, payload: Bytes) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if self.session().is_none() {
                return Err(Error::publish(queue, "channel closed"));
            }

            let state = self
                .server
                .queue(queue)
                .ok_or_else(|| Error::publish(queue, "no route to queue"))?;

            state.push_back(Entry {
                body: payload,
                redelivered: false,
            });

            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Consumer, Error>> {
        Box::pin(async move {
            let session = self.session().ok_or_else(Error::not_connected)?;

            let state = self
                .server
                .queue(queue)
                .ok_or_else(|| Error::connection(format!("queue {queue} not declared")))?;

            let in_flight = Arc::new(Semaphore::new(PREFETCH as usize));

            let deliveries = stream::unfold(
                (state, in_flight, session),
                |(state, in_flight, session)| async move {
                    let permit = tokio::select! {
                        _ = session.cancelled() => return None,
                        permit = in_flight.clone().acquire_owned() => permit.ok()?,
                    };

                    let entry = loop {
                        if let Some(entry) = state.pop() {
                            break entry;
                        }

                        tokio::select! {
                            _ = session.cancelled() => return None,
                            _ = state.ready.notified() => {}
                        }
                    };

                    let delivery = Delivery::new(
                        entry.body.clone(),
                        entry.redelivered,
                        MemoryAcker {
                            queue: state.clone(),
                            entry: Some(entry),
                            _permit: permit,
                        },
                    );

                    Some((Ok(delivery), (state, in_flight, session)))
                },
            )
            .boxed();

            Ok(Consumer::new(deliveries))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if let Some(session) = self
                .session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                session.cancel();
            }
            Ok(())
        })
    }
}

struct MemoryAcker {
    queue: Arc<QueueState>,
    entry: Option<Entry>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn settle(&mut self, requeue: bool) {
        if let Some(entry) = self.entry.take() {
            if requeue {
                self.queue.push_front(Entry {
                    body: entry.body,
                    redelivered: true,
                });
            }
        }
    }
}

impl Acknowledge for MemoryAcker {
    fn ack(mut self: Box<Self>) -> BoxFuture<'static, Result<(), Error>> {
        self.settle(false);
        Box::pin(async { Ok(()) })
    }

    fn requeue(mut self: Box<Self>) -> BoxFuture<'static, Result<(), Error>> {
        self.settle(true);
        Box::pin(async { Ok(()) })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.settle(true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn connected(server: &InMemoryServer, queue: &str) -> InMemoryBroker {
        let client = server.client();
        client.connect().await.unwrap();
        client.declare_queue(queue).await.unwrap();
        client
    }

    #[tokio::test]
    async fn publish_requires_declared_queue() {
        let server = InMemoryServer::new();
        let client = server.client();
        client.connect().await.unwrap();

        let err = client
            .publish("missing", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
    }

    #[tokio::test]
    async fn operations_fail_without_session() {
        let server = InMemoryServer::new();
        let client = server.client();

        assert!(matches!(
            client.declare_queue("q").await,
            Err(Error::Connection { .. })
        ));

        client.connect().await.unwrap();
        client.declare_queue("q").await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(matches!(
            client.publish("q", Bytes::from_static(b"{}")).await,
            Err(Error::Publish { .. })
        ));

        client.connect().await.unwrap();
        client.publish("q", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(server.pending("q").len(), 1);
    }

    #[tokio::test]
    async fn queues_outlive_sessions() {
        let server = InMemoryServer::new();
        let producer = connected(&server, "q").await;
        producer.publish("q", Bytes::from_static(b"a")).await.unwrap();
        producer.close().await.unwrap();

        let worker = connected(&server, "q").await;
        let mut consumer = worker.consume("q").await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), b"a");
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn one_unsettled_delivery_at_a_time() {
        let server = InMemoryServer::new();
        let client = connected(&server, "q").await;
        client.publish("q", Bytes::from_static(b"1")).await.unwrap();
        client.publish("q", Bytes::from_static(b"2")).await.unwrap();

        let mut consumer = client.consume("q").await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.body(), b"1");

        let blocked = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();

        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.body(), b"2");
        assert!(!second.redelivered());
        second.ack().await.unwrap();
        assert!(server.pending("q").is_empty());
    }

    #[tokio::test]
    async fn requeue_and_drop_redeliver_first() {
        let server = InMemoryServer::new();
        let client = connected(&server, "q").await;
        client.publish("q", Bytes::from_static(b"1")).await.unwrap();
        client.publish("q", Bytes::from_static(b"2")).await.unwrap();

        let mut consumer = client.consume("q").await.unwrap();

        consumer.next().await.unwrap().unwrap().requeue().await.unwrap();
        let again = consumer.next().await.unwrap().unwrap();
        assert_eq!(again.body(), b"1");
        assert!(again.redelivered());

        drop(again);
        assert_eq!(server.pending("q"), vec![Bytes::from("1"), Bytes::from("2")]);
    }

    #[tokio::test]
    async fn close_ends_consumer() {
        let server = InMemoryServer::new();
        let client = connected(&server, "q").await;
        let mut consumer = client.consume("q").await.unwrap();

        client.close().await.unwrap();

        assert!(consumer.next().await.is_none());
    }
}
