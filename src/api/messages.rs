use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Error, message::Message, producer::Submission};

use super::State;

const LIST_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    action: Option<String>,
    data: Option<Value>,
    queue: Option<String>,
    priority: Option<Value>,
    metadata: Option<Value>,
}

#[derive(Serialize)]
pub struct CreateMessageResponse {
    status: &'static str,
    message_id: i64,
    queue: String,
    action: String,
    message: &'static str,
}

#[post("")]
async fn create_message(
    state: web::Data<State>,
    body: web::Json<CreateMessageRequest>,
) -> Result<impl Responder, Error> {
    let request = body.into_inner();

    let action = match request.action {
        Some(action) if !action.trim().is_empty() => action,
        _ => {
            tracing::warn!("Message creation failed: missing action");
            return Err(Error::invalid_parameter("Action is required"));
        }
    };

    let data = match request.data {
        Some(Value::Object(data)) => data,
        _ => {
            tracing::warn!(%action, "Message creation failed: missing or invalid data");
            return Err(Error::invalid_parameter(
                "Data field is required and must be an object",
            ));
        }
    };

    let submission = Submission::builder()
        .queue(request.queue.unwrap_or_else(|| state.queue.clone()))
        .action(action)
        .data(data)
        .maybe_priority(request.priority)
        .maybe_metadata(request.metadata)
        .build();

    let receipt = state.producer.submit(submission).await?;

    Ok(HttpResponse::Accepted().json(CreateMessageResponse {
        status: "accepted",
        message_id: receipt.id,
        queue: receipt.queue,
        action: receipt.action,
        message: "Message has been queued for processing",
    }))
}

#[derive(Serialize)]
pub struct ListMessagesResponse {
    messages: Vec<Message>,
    count: usize,
}

#[get("")]
async fn list_messages(state: web::Data<State>) -> Result<impl Responder, Error> {
    let messages = state.producer.store().list_messages(LIST_LIMIT).await?;

    tracing::info!(count = messages.len(), "Messages list requested");

    Ok(web::Json(ListMessagesResponse {
        count: messages.len(),
        messages,
    }))
}

#[get("/{id}")]
async fn get_message(
    state: web::Data<State>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    let id = path
        .parse::<i64>()
        .map_err(|_| Error::invalid_parameter("Invalid message ID"))?;

    let message = state
        .producer
        .store()
        .get_message(id)
        .await?
        .ok_or_else(|| Error::message_not_found(id))?;

    Ok(web::Json(message))
}

pub fn service() -> Scope {
    web::scope("/messages")
        .service(create_message)
        .service(list_messages)
        .service(get_message)
}
