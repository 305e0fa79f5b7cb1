//! SQL for the tables owned by the message store.

pub mod message;
pub mod user;
