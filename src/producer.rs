use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    broker::Broker,
    error::Error,
    message::{Action, Envelope, MessageStatus},
    store::Store,
};

/// A unit of work to hand to the queue.
#[derive(Debug, Clone, bon::Builder)]
pub struct Submission {
    #[builder(into)]
    pub queue: String,
    #[builder(into)]
    pub action: String,
    #[builder(default)]
    pub data: Map<String, Value>,
    pub priority: Option<Value>,
    pub metadata: Option<Value>,
}

impl Submission {
    /// A `create_user` submission, stamped with the local submission time.
    pub fn create_user(queue: impl Into<String>, name: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("name".to_owned(), Value::String(name.into()));
        data.insert(
            "timestamp".to_owned(),
            Value::String(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
        );

        Self::builder()
            .queue(queue)
            .action(Action::CREATE_USER)
            .data(data)
            .build()
    }
}

/// What the caller gets back for an accepted submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub id: i64,
    pub queue: String,
    pub action: String,
}

/// Logs messages as `sent` and publishes them to the broker.
///
/// The broker session is reopened on demand, and every destination queue is
/// declared before the first publish to it.
#[derive(Clone)]
pub struct Producer {
    store: Store,
    broker: Arc<dyn Broker>,
    source: String,
    declared: Arc<papaya::HashSet<String>>,
}

impl Producer {
    pub fn new(store: Store, broker: Arc<dyn Broker>, source: impl Into<String>) -> Self {
        Self {
            store,
            broker,
            source: source.into(),
            declared: Arc::new(papaya::HashSet::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Connects if needed and declares `queue` so publishes can be routed.
    pub async fn ensure_queue(&self, queue: &str) -> Result<(), Error> {
        self.broker.connect().await?;
        self.declare(queue).await
    }

    async fn declare(&self, queue: &str) -> Result<(), Error> {
        if self.declared.pin().contains(queue) {
            return Ok(());
        }

        self.broker.declare_queue(queue).await?;
        self.declared.pin().insert(queue.to_owned());

        Ok(())
    }

    async fn deliver(&self, queue: &str, payload: Bytes) -> Result<(), Error> {
        self.ensure_queue(queue).await?;

        let res = self.broker.publish(queue, payload).await;

        if res.is_err() {
            // Redeclare on the next attempt, the queue may be gone.
            self.declared.pin().remove(queue);
        }

        res
    }

    /// Records the message and publishes it.
    ///
    /// The row is written first and is not rolled back if the publish fails:
    /// it stays in `sent` status and the error is returned to the caller.
    pub async fn submit(&self, submission: Submission) -> Result<Receipt, Error> {
        if submission.queue.trim().is_empty() {
            return Err(Error::invalid_parameter("queue must not be empty"));
        }
        if submission.action.trim().is_empty() {
            return Err(Error::invalid_parameter("action is required"));
        }

        let mut envelope = Envelope {
            action: submission.action,
            data: submission.data,
            created_at: Utc::now(),
            source: self.source.clone(),
            queue: Some(submission.queue.clone()),
            priority: submission.priority,
            metadata: submission.metadata,
            message_id: None,
        };

        let id = self
            .store
            .log_message(
                &submission.queue,
                &envelope.to_value()?,
                MessageStatus::Sent,
                None,
            )
            .await?;

        envelope.message_id = Some(id);

        let payload = Bytes::from(envelope.encode()?);

        if let Err(e) = self.deliver(&submission.queue, payload).await {
            tracing::error!(
                message_id = id,
                queue = %submission.queue,
                action = %envelope.action,
                "Message logged but not delivered: {e}"
            );
            return Err(e);
        }

        tracing::info!(
            message_id = id,
            queue = %submission.queue,
            action = %envelope.action,
            "Message created and sent to queue"
        );

        Ok(Receipt {
            id,
            queue: submission.queue,
            action: envelope.action,
        })
    }
}
