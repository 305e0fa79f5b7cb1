use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Broker connection failed: {message}"))]
    Connection {
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database: {source}"))]
    Persistence {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Publish to queue {queue} failed: {reason}"))]
    Publish { queue: String, reason: String },

    #[snafu(display("Unknown action: {action}"))]
    UnknownAction { action: String },

    #[snafu(display("Invalid data for {action}: {message}"))]
    InvalidPayload { action: String, message: String },

    #[snafu(display("{message}"))]
    Handler {
        message: String,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Malformed message body: {source}"))]
    Deserialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Persistence { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl Error {
    pub fn connection(e: impl std::fmt::Display) -> Self {
        Self::Connection {
            message: e.to_string(),
            source: None,
        }
    }

    pub fn not_connected() -> Self {
        Self::Connection {
            message: "session not established".to_owned(),
            source: None,
        }
    }

    pub fn publish(queue: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Publish {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn message_not_found(id: i64) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::InvalidParameter { .. }
            | Self::InvalidPayload { .. }
            | Self::UnknownAction { .. }
            | Self::Deserialization { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::Connection { .. }
            | Self::Persistence { .. }
            | Self::MigrationError { .. }
            | Self::Publish { .. }
            | Self::Handler { .. }
            | Self::InternalServerError { .. } => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
