use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    Acquire, SqlitePool,
};

use crate::{
    config::Config,
    db::user::User,
    error::Error,
    message::{Message, MessageStatus},
};

/// Durable record of every message and its status.
///
/// Cloning is cheap; clones share the same connection pool.
#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(db_path = config.db_path(), "Message store connected");

        Ok(Self { db: pool })
    }

    /// Records a new message and returns its id.
    pub async fn log_message(
        &self,
        queue: impl AsRef<str>,
        data: &Value,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<i64, Error> {
        let mut conn = self.db.acquire().await?;

        Ok(Message::insert(conn.acquire().await?, queue, data, status, error_message).await?)
    }

    /// Moves message `id` to `status`. Fails with [`Error::Persistence`] if
    /// the row doesn't exist.
    pub async fn update_status(
        &self,
        id: i64,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;

        Ok(Message::set_status(conn.acquire().await?, id, status, error_message).await?)
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::get(conn.acquire().await?, id).await?)
    }

    /// Most recent messages first.
    pub async fn list_messages(&self, limit: u32) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Message::list(conn.acquire().await?, limit).await?)
    }

    /// Inserts a user row; `None` if `message_id` already produced one.
    pub async fn insert_user(
        &self,
        name: impl AsRef<str>,
        message_id: Option<i64>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let mut conn = self.db.acquire().await?;
        User::insert(conn.acquire().await?, name, message_id).await
    }

    pub async fn list_users(&self, limit: u32) -> Result<Vec<User>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(User::list(conn.acquire().await?, limit).await?)
    }

    pub async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
