use actix_web::{get, web, Responder};
use serde_json::json;

use crate::producer::Producer;

pub mod health;
pub mod messages;
pub mod users;

/// Shared state for the HTTP handlers.
pub struct State {
    pub producer: Producer,
    /// Queue used when a request doesn't name one.
    pub queue: String,
}

#[get("/")]
pub async fn index(state: web::Data<State>) -> impl Responder {
    web::Json(json!({
        "service": "courier",
        "version": env!("CARGO_PKG_VERSION"),
        "default_queue": state.queue,
        "endpoints": {
            "GET /": "API documentation",
            "GET /health": "Health check",
            "POST /users": "Create a new user (queued)",
            "GET /users": "List users",
            "POST /messages": "Create a custom message (queued)",
            "GET /messages": "List messages",
            "GET /messages/{id}": "Get message by ID",
        },
    }))
}
