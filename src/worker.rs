//! Worker supervisor.
//!
//! The supervisor owns the worker's broker session: it connects, declares
//! the queue, and feeds deliveries one at a time to the [`Processor`]. When
//! any of that fails it tears the session down, waits according to its
//! [`Backoff`], and starts over. The attempt counter is reset as soon as a
//! consume session is established.
//!
//! Message-level retries are not handled here; they follow from whether the
//! processor acknowledges or requeues a delivery.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{broker::Broker, error::Error};

pub mod handler;
pub mod processor;

pub use processor::{Outcome, Processor};

/// Exponential backoff: `min(max, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Waits between restart attempts. Swappable so tests don't sleep.
pub trait Sleep: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

pub struct TokioSleep;

impl Sleep for TokioSleep {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(bon::Builder)]
pub struct Supervisor {
    broker: Arc<dyn Broker>,
    processor: Processor,
    #[builder(into)]
    queue: String,
    #[builder(default)]
    backoff: Backoff,
    #[builder(default = Arc::new(TokioSleep) as Arc<dyn Sleep>)]
    sleep: Arc<dyn Sleep>,
}

impl Supervisor {
    /// Runs until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between deliveries and while backing
    /// off; a message being processed always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let result = self.session(&mut attempt, &shutdown).await;

            if let Err(e) = self.broker.close().await {
                tracing::warn!("Failed to close broker session: {e}");
            }

            let error = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            let wait = self.backoff.delay(attempt);

            tracing::warn!(
                attempt,
                wait_secs = wait.as_secs_f64(),
                error = %error,
                "Worker restarting after error"
            );

            attempt = attempt.saturating_add(1);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.sleep.sleep(wait) => {}
            }
        }

        tracing::info!("Worker stopped");
    }

    /// One connect/consume cycle. Returns `Ok` only on shutdown.
    async fn session(&self, attempt: &mut u32, shutdown: &CancellationToken) -> Result<(), Error> {
        self.broker.connect().await?;
        self.broker.declare_queue(&self.queue).await?;

        let mut consumer = self.broker.consume(&self.queue).await?;

        *attempt = 0;

        tracing::info!(queue = %self.queue, "Worker started and waiting for messages");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                next = consumer.next() => match next {
                    Some(delivery) => delivery?,
                    None => return Err(Error::connection("consumer cancelled by broker")),
                },
            };

            if delivery.redelivered() {
                tracing::debug!("Handling redelivered message");
            }

            let outcome = self.processor.handle(delivery.body()).await;

            if outcome.should_ack() {
                delivery.ack().await?;
                continue;
            }

            delivery.requeue().await?;

            if let Outcome::Deferred { error } = outcome {
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use bytes::Bytes;
    use futures_util::{stream, StreamExt};

    use crate::{broker::Consumer, store::Store};

    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = Backoff::default();

        let delays: Vec<u64> = (0..8).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);

        assert_eq!(backoff.delay(31), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    /// Refuses the first `failures` connects; every consume session ends
    /// right away.
    struct FlakyBroker {
        failures: AtomicU32,
        sessions: AtomicU32,
    }

    impl FlakyBroker {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                sessions: AtomicU32::new(0),
            }
        }
    }

    impl Broker for FlakyBroker {
        fn connect(&self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async move {
                let refused = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();

                if refused {
                    Err(Error::connection("connection refused"))
                } else {
                    Ok(())
                }
            })
        }

        fn declare_queue<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn publish<'a>(&'a self, _: &'a str, _: Bytes) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }

        fn consume<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<Consumer, Error>> {
            Box::pin(async move {
                self.sessions.fetch_add(1, Ordering::SeqCst);
                Ok(Consumer::new(stream::empty().boxed()))
            })
        }

        fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Records requested waits and cancels after `limit` of them.
    struct Recorder {
        waits: Mutex<Vec<Duration>>,
        limit: usize,
        shutdown: CancellationToken,
    }

    impl Sleep for Recorder {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            let mut waits = self.waits.lock().unwrap();
            waits.push(duration);
            if waits.len() >= self.limit {
                self.shutdown.cancel();
            }
            Box::pin(async {})
        }
    }

    async fn run_with(broker: Arc<FlakyBroker>, limit: usize) -> Vec<u64> {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::connect_with(&crate::config::Config {
            db_path: Some(tmp.path().join("courier.db").to_string_lossy().to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let shutdown = CancellationToken::new();
        let recorder = Arc::new(Recorder {
            waits: Mutex::new(Vec::new()),
            limit,
            shutdown: shutdown.clone(),
        });

        Supervisor::builder()
            .broker(broker)
            .processor(Processor::new(store, "data_queue"))
            .queue("data_queue")
            .sleep(recorder.clone())
            .build()
            .run(shutdown)
            .await;

        let waits = recorder.waits.lock().unwrap();
        waits.iter().map(Duration::as_secs).collect()
    }

    #[tokio::test]
    async fn backs_off_on_consecutive_failures() {
        let waits = run_with(Arc::new(FlakyBroker::new(u32::MAX)), 7).await;
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn resets_after_session_starts() {
        let broker = Arc::new(FlakyBroker::new(2));
        let waits = run_with(broker.clone(), 4).await;

        assert_eq!(waits, vec![1, 2, 1, 1]);
        assert_eq!(broker.sessions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_when_already_cancelled() {
        let broker = Arc::new(FlakyBroker::new(0));
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::connect_with(&crate::config::Config {
            db_path: Some(tmp.path().join("courier.db").to_string_lossy().to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        Supervisor::builder()
            .broker(broker.clone())
            .processor(Processor::new(store, "data_queue"))
            .queue("data_queue")
            .build()
            .run(shutdown)
            .await;

        assert_eq!(broker.sessions.load(Ordering::SeqCst), 0);
    }
}
