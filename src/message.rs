//! Message types and status management for the work-queue pipeline.
//!
//! This module defines the persisted message row, its lifecycle states, and
//! the envelope that travels over the broker.
//!
//! # Message Lifecycle
//!
//! 1. The producer records a message in `Sent` status before publishing it
//! 2. The worker moves it to `Processing` when a delivery is received
//! 3. It ends in `Processed` when the action succeeds, or `Error` when it
//!    fails permanently
//!
//! A malformed delivery that never had a `Sent` row is recorded directly in
//! `Error` status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{prelude::FromRow, types::Json};

use crate::error::Error;

/// Represents the current status of a message row.
///
/// Transitions only move forward:
/// `Sent` -> `Processing` -> `Processed` (success case)
/// `Sent` -> `Processing` -> `Error`     (failure case)
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(type_name = "text")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Logged by the producer and handed to the broker
    #[serde(rename = "sent")]
    #[sqlx(rename = "sent")]
    Sent,
    /// Received by a worker; the action is running
    #[serde(rename = "processing")]
    #[sqlx(rename = "processing")]
    Processing,
    /// The action completed and the delivery was acknowledged
    #[serde(rename = "processed")]
    #[sqlx(rename = "processed")]
    Processed,
    /// The message failed permanently and will not be retried
    #[serde(rename = "error")]
    #[sqlx(rename = "error")]
    Error,
}

impl MessageStatus {
    /// Whether a row in this status may be moved to `next`.
    ///
    /// `Processing -> Processing` is allowed so that a delivery redelivered
    /// after a worker crash can be picked up again.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        matches!(
            (self, next),
            (Sent, Processing)
                | (Processing, Processing)
                | (Processing, Processed)
                | (Processing, Error)
        )
    }
}

/// A message row as stored by the message store.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub queue_name: String,
    pub message_data: Json<Value>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// The payload carried through the broker.
///
/// Only `action` and `data` are required; a body from another producer gets
/// `created_at` stamped on receipt and `source` set to `unknown`.
/// `message_id` is filled in by the producer after the `sent` row exists, so
/// the worker can update that row instead of creating a second one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub action: String,
    pub data: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Envelope::unknown_source")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
}

impl Envelope {
    fn unknown_source() -> String {
        "unknown".to_owned()
    }

    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(body).map_err(|source| Error::Deserialization { source })
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(Error::internal)
    }

    /// The envelope as stored in `messages.message_data`.
    pub fn to_value(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(Error::internal)
    }

    pub fn action(&self) -> Action {
        Action::from_envelope(self)
    }
}

/// Arguments of the `create_user` action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CreateUser {
    pub name: String,
}

/// The closed set of actions a worker knows how to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CreateUser(CreateUser),
    /// `create_user` whose data didn't match its schema.
    Invalid { action: String, message: String },
    /// Any action name this build doesn't recognise.
    Unknown { action: String },
}

impl Action {
    pub const CREATE_USER: &'static str = "create_user";

    pub fn from_envelope(envelope: &Envelope) -> Self {
        match envelope.action.as_str() {
            Self::CREATE_USER => {
                match serde_json::from_value::<CreateUser>(Value::Object(envelope.data.clone())) {
                    Ok(args) if args.name.trim().is_empty() => Self::Invalid {
                        action: envelope.action.clone(),
                        message: "name must not be empty".to_owned(),
                    },
                    Ok(args) => Self::CreateUser(args),
                    Err(e) => Self::Invalid {
                        action: envelope.action.clone(),
                        message: e.to_string(),
                    },
                }
            }
            other => Self::Unknown {
                action: other.to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(action: &str, data: Value) -> Envelope {
        Envelope {
            action: action.to_owned(),
            data: data.as_object().cloned().unwrap_or_default(),
            created_at: Utc::now(),
            source: "test".to_owned(),
            queue: None,
            priority: None,
            metadata: None,
            message_id: None,
        }
    }

    #[test]
    fn status_transitions_only_move_forward() {
        use MessageStatus::*;

        assert!(Sent.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Error));
        assert!(Processing.can_transition_to(Processing));

        assert!(!Sent.can_transition_to(Processed));
        assert!(!Processed.can_transition_to(Processing));
        assert!(!Error.can_transition_to(Processed));
        assert!(!Processed.can_transition_to(Sent));
    }

    #[test]
    fn status_text_form() {
        assert_eq!(MessageStatus::Processing.to_string(), "processing");
        assert_eq!(
            "error".parse::<MessageStatus>().unwrap(),
            MessageStatus::Error
        );
    }

    #[test]
    fn decode_requires_only_action_and_data() {
        let ok = br#"{"action":"create_user","data":{"name":"Ada"},"created_at":"2024-05-01T10:00:00Z"}"#;
        let env = Envelope::decode(ok).unwrap();
        assert_eq!(env.source, "unknown");
        assert_eq!(env.message_id, None);

        let minimal = br#"{"action":"create_user","data":{"name":"Ada"}}"#;
        let before = Utc::now();
        let env = Envelope::decode(minimal).unwrap();
        assert!(env.created_at >= before);
        assert_eq!(env.source, "unknown");

        let missing_data = br#"{"action":"create_user","created_at":"2024-05-01T10:00:00Z"}"#;
        assert!(matches!(
            Envelope::decode(missing_data),
            Err(Error::Deserialization { .. })
        ));

        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(Error::Deserialization { .. })
        ));
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let value = envelope("create_user", serde_json::json!({ "name": "Ada" }))
            .to_value()
            .unwrap();

        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("created_at"));
        assert!(obj.contains_key("source"));
        assert!(!obj.contains_key("priority"));
        assert!(!obj.contains_key("message_id"));
    }

    #[test]
    fn action_dispatch_is_closed() {
        let create = envelope("create_user", serde_json::json!({ "name": "Ada" }));
        assert_eq!(
            create.action(),
            Action::CreateUser(CreateUser {
                name: "Ada".to_owned()
            })
        );

        let missing_name = envelope("create_user", serde_json::json!({}));
        assert!(matches!(missing_name.action(), Action::Invalid { .. }));

        let blank = envelope("create_user", serde_json::json!({ "name": "  " }));
        assert!(matches!(blank.action(), Action::Invalid { .. }));

        let unknown = envelope("send_email", serde_json::json!({}));
        assert_eq!(
            unknown.action(),
            Action::Unknown {
                action: "send_email".to_owned()
            }
        );
    }
}
