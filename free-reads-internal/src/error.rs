use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

/// Message returned to callers when the durable store fails. The underlying cause is only logged.
pub const BACKEND_UNAVAILABLE_MESSAGE: &str = "Quota backend is temporarily unavailable";

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(*self.0, ErrorDetails::BackendUnavailable { .. })
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    /// The durable store is configured but a call to it failed or timed out.
    BackendUnavailable {
        operation: String,
        message: String,
    },
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    /// A request field is missing or malformed. `field` is the JSON path of the offending value.
    InvalidArgument {
        field: String,
        message: String,
    },
    Observability {
        message: String,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::BackendUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidArgument { .. } => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::BackendUnavailable { operation, message } => {
                write!(f, "Quota backend failed during `{operation}`: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidArgument { field, message } => {
                write!(f, "Invalid argument `{field}`: {message}")
            }
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Get the JSON response body that would be sent to clients
    /// Returns (StatusCode, JSON Value) tuple matching what into_response() creates
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let body = match self.get_details() {
            ErrorDetails::InvalidArgument { field, message } => json!({
                "error": { "field": field, "message": message }
            }),
            // Store details stay in the logs
            ErrorDetails::BackendUnavailable { .. } => json!({
                "error": { "message": BACKEND_UNAVAILABLE_MESSAGE }
            }),
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::Observability { .. } => json!({
                "error": { "message": "Internal server error" }
            }),
            ErrorDetails::RouteNotFound { .. } => json!({
                "error": { "message": self.to_string() }
            }),
        };
        (self.status_code(), body)
    }
}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
