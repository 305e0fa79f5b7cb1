use actix_web::{get, web, HttpResponse, Scope};
use chrono::Utc;
use serde::Serialize;

use super::State;

#[derive(Serialize)]
struct Health {
    status: &'static str,
    timestamp: String,
    service: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[get("")]
async fn health(state: web::Data<State>) -> HttpResponse {
    let mut health = Health {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        service: "courier-api",
        version: env!("CARGO_PKG_VERSION"),
        error: None,
    };

    match state.producer.store().ping().await {
        Ok(()) => HttpResponse::Ok().json(health),
        Err(e) => {
            tracing::error!("Health check failed: {e}");
            health.status = "unhealthy";
            health.error = Some(e.to_string());
            HttpResponse::InternalServerError().json(health)
        }
    }
}

pub fn service() -> Scope {
    web::scope("/health").service(health)
}
