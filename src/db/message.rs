use chrono::Utc;
use serde_json::Value;
use sqlx::{types::Json, SqliteConnection};
use tokio_stream::StreamExt;

use crate::message::{Message, MessageStatus};

impl Message {
    /// Inserts a row and returns its id in a single statement.
    pub async fn insert(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
        data: &Value,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "
            INSERT INTO messages (queue_name, message_data, status, created_at, error_message)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(queue.as_ref())
        .bind(Json(data))
        .bind(status)
        .bind(Utc::now())
        .bind(error_message)
        .fetch_one(db)
        .await
    }

    /// Sets the status of `id`. `processed_at` is stamped only for
    /// `Processed` and `error_message` is kept only for `Error`; both are
    /// cleared for any other status.
    pub async fn set_status(
        db: &mut SqliteConnection,
        id: i64,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let processed_at = (status == MessageStatus::Processed).then(Utc::now);
        let error_message = error_message.filter(|_| status == MessageStatus::Error);

        let res = sqlx::query(
            "
            UPDATE messages
            SET status = $1, processed_at = $2, error_message = $3
            WHERE id = $4
            ",
        )
        .bind(status)
        .bind(processed_at)
        .bind(error_message)
        .bind(id)
        .execute(db)
        .await?;

        if res.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }

        Ok(())
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> Result<Option<Message>, sqlx::Error> {
        sqlx::query_as(
            "
            SELECT id, queue_name, message_data, status, created_at, processed_at, error_message
            FROM messages
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(db)
        .await
    }

    pub async fn list(db: &mut SqliteConnection, limit: u32) -> Result<Vec<Message>, sqlx::Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT id, queue_name, message_data, status, created_at, processed_at, error_message
            FROM messages
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch(db);

        let mut messages = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            messages.push(res);
        }

        Ok(messages)
    }
}
