use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};

/// Row of the `users` table, written by the `create_user` action.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    /// Message that created this user, if it came through the queue.
    pub message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Inserts a user. Returns `None` when a user already exists for
    /// `message_id`, which makes re-applying the same message a no-op.
    pub async fn insert(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
        message_id: Option<i64>,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "
            INSERT INTO users (name, message_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (message_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(name.as_ref())
        .bind(message_id)
        .bind(Utc::now())
        .fetch_optional(db)
        .await
    }

    pub async fn list(db: &mut SqliteConnection, limit: u32) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as(
            "
            SELECT id, name, message_id, created_at
            FROM users
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(db)
        .await
    }
}
