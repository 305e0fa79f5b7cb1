use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{db::user::User, error::Error, producer::Submission};

use super::State;

const LIST_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    name: Option<String>,
}

#[derive(Serialize)]
pub struct CreateUserResponse {
    status: &'static str,
    message_id: i64,
    message: &'static str,
}

#[post("")]
async fn create_user(
    state: web::Data<State>,
    body: web::Json<CreateUserRequest>,
) -> Result<impl Responder, Error> {
    let name = match body.into_inner().name {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            tracing::warn!("User creation failed: missing name");
            return Err(Error::invalid_parameter("Name is required"));
        }
    };

    let receipt = state
        .producer
        .submit(Submission::create_user(&state.queue, &name))
        .await?;

    Ok(HttpResponse::Accepted().json(CreateUserResponse {
        status: "accepted",
        message_id: receipt.id,
        message: "User creation request has been queued",
    }))
}

#[derive(Serialize)]
pub struct ListUsersResponse {
    users: Vec<User>,
    count: usize,
}

#[get("")]
async fn list_users(state: web::Data<State>) -> Result<impl Responder, Error> {
    let users = state.producer.store().list_users(LIST_LIMIT).await?;

    tracing::info!(count = users.len(), "Users list requested");

    Ok(web::Json(ListUsersResponse {
        count: users.len(),
        users,
    }))
}

pub fn service() -> Scope {
    web::scope("/users").service(create_user).service(list_users)
}
