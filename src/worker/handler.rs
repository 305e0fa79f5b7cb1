//! Action handlers. The set of actions is closed: anything not matched here
//! fails permanently.

use snafu::ResultExt;

use crate::{
    error::{Error, HandlerSnafu},
    message::{Action, CreateUser},
    store::Store,
};

/// Runs `action` on behalf of message `message_id`.
pub async fn dispatch(store: &Store, message_id: i64, action: Action) -> Result<(), Error> {
    match action {
        Action::CreateUser(args) => create_user(store, message_id, args).await,
        Action::Invalid { action, message } => Err(Error::InvalidPayload { action, message }),
        Action::Unknown { action } => Err(Error::UnknownAction { action }),
    }
}

async fn create_user(store: &Store, message_id: i64, args: CreateUser) -> Result<(), Error> {
    tracing::info!(message_id, name = %args.name, "Processing user creation");

    let inserted = store
        .insert_user(&args.name, Some(message_id))
        .await
        .context(HandlerSnafu {
            message: format!("Failed to add user: {}", args.name),
        })?;

    match inserted {
        Some(user_id) => {
            tracing::info!(message_id, user_id, name = %args.name, "User created successfully")
        }
        None => tracing::info!(message_id, name = %args.name, "User already created for message"),
    }

    Ok(())
}
