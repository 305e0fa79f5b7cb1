use std::time::Instant;

use serde_json::Value;

use crate::{
    error::Error,
    message::{Envelope, MessageStatus},
    store::Store,
};

use super::handler;

/// Result of handling one delivery.
#[derive(Debug)]
pub enum Outcome {
    /// The action ran and the row is `processed`.
    Processed { id: i64 },
    /// The action failed permanently and the row is `error`.
    Failed { id: i64, error: String },
    /// The row was already terminal; the action was not run again.
    Skipped { id: i64, status: MessageStatus },
    /// The body could not be decoded; it was logged straight to `error`.
    Rejected { id: i64 },
    /// Receipt could not be recorded. The delivery must go back to the
    /// broker.
    Deferred { error: Error },
}

impl Outcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::Deferred { .. })
    }
}

enum Receipt {
    Started(i64),
    Settled { id: i64, status: MessageStatus },
}

/// Drives a single delivery from receipt to a terminal status.
#[derive(Clone)]
pub struct Processor {
    store: Store,
    queue: String,
}

impl Processor {
    pub fn new(store: Store, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    pub async fn handle(&self, body: &[u8]) -> Outcome {
        let started = Instant::now();

        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e) => return self.reject(body, e).await,
        };

        tracing::info!(
            action = %envelope.action,
            message_id = ?envelope.message_id,
            message_size = body.len(),
            "Message received"
        );

        let id = match self.receive(&envelope).await {
            Ok(Receipt::Started(id)) => id,
            Ok(Receipt::Settled { id, status }) => {
                tracing::info!(message_id = id, %status, "Message already settled, skipping");
                return Outcome::Skipped { id, status };
            }
            Err(error) => {
                tracing::error!(action = %envelope.action, "Failed to record message receipt: {error}");
                return Outcome::Deferred { error };
            }
        };

        match handler::dispatch(&self.store, id, envelope.action()).await {
            Ok(()) => {
                if let Err(e) = self
                    .store
                    .update_status(id, MessageStatus::Processed, None)
                    .await
                {
                    tracing::error!(message_id = id, "Failed to record processed status: {e}");
                }

                tracing::info!(
                    message_id = id,
                    processing_ms = started.elapsed().as_millis() as u64,
                    "Message processed successfully"
                );

                Outcome::Processed { id }
            }
            Err(e) => {
                let error = e.to_string();

                tracing::error!(
                    message_id = id,
                    processing_ms = started.elapsed().as_millis() as u64,
                    error_message = %error,
                    "Message processing failed"
                );

                if let Err(e) = self
                    .store
                    .update_status(id, MessageStatus::Error, Some(&error))
                    .await
                {
                    tracing::error!(message_id = id, "Failed to record error status: {e}");
                }

                Outcome::Failed { id, error }
            }
        }
    }

    /// Moves the producer's row to `processing`, or creates one when the
    /// envelope doesn't point at an existing row.
    async fn receive(&self, envelope: &Envelope) -> Result<Receipt, Error> {
        if let Some(id) = envelope.message_id {
            match self.store.get_message(id).await? {
                Some(row) if !row.status.can_transition_to(MessageStatus::Processing) => {
                    return Ok(Receipt::Settled {
                        id,
                        status: row.status,
                    });
                }
                Some(_) => {
                    self.store
                        .update_status(id, MessageStatus::Processing, None)
                        .await?;
                    return Ok(Receipt::Started(id));
                }
                None => {
                    tracing::warn!(message_id = id, "No row for message, logging a new one");
                }
            }
        }

        let id = self
            .store
            .log_message(
                &self.queue,
                &envelope.to_value()?,
                MessageStatus::Processing,
                None,
            )
            .await?;

        Ok(Receipt::Started(id))
    }

    async fn reject(&self, body: &[u8], error: Error) -> Outcome {
        let error = error.to_string();

        tracing::error!(message_size = body.len(), "Malformed message: {error}");

        let data = serde_json::from_slice::<Value>(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));

        match self
            .store
            .log_message(&self.queue, &data, MessageStatus::Error, Some(&error))
            .await
        {
            Ok(id) => Outcome::Rejected { id },
            Err(error) => {
                tracing::error!("Failed to log malformed message: {error}");
                Outcome::Deferred { error }
            }
        }
    }
}
