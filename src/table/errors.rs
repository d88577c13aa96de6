//! # Table Resource Errors
//!
//! Error taxonomy for the table-resource pipeline.
//!
//! - Request errors fail before any batch work starts.
//! - Per-item errors land in the batch error ledger.
//! - Configuration errors abort a batch unconditionally.
//! - Driver errors are per-item during iteration and fatal during commit.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Result type for table-resource operations
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Coarse error class, kept when an error is rewrapped as a batch error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    NotFound,
    Configuration,
    Driver,
}

impl ErrorKind {
    /// HTTP status for this class
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Driver => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Table resource errors
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    // ==================
    // Client Errors (4xx)
    // ==================
    /// Bad input shape, conflicting options, failed field validation
    #[error("{0}")]
    BadRequest(String),

    /// Denied by an access filter or permission check
    #[error("{0}")]
    Forbidden(String),

    /// Unknown table or record
    #[error("{0}")]
    NotFound(String),

    // ==================
    // Server Errors (5xx)
    // ==================
    /// Server-side configuration problem (undeterminable ids, bad combiner)
    #[error("{0}")]
    Configuration(String),

    /// Backing store failure
    #[error("{0}")]
    Driver(String),

    /// Batch failure carrying `{error: [...], <record_key>: [...]}` context
    #[error("{message}")]
    Batch {
        kind: ErrorKind,
        message: String,
        context: Value,
    },
}

impl ResourceError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Error class, looking through batch wrapping
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResourceError::BadRequest(_) => ErrorKind::BadRequest,
            ResourceError::Forbidden(_) => ErrorKind::Forbidden,
            ResourceError::NotFound(_) => ErrorKind::NotFound,
            ResourceError::Configuration(_) => ErrorKind::Configuration,
            ResourceError::Driver(_) => ErrorKind::Driver,
            ResourceError::Batch { kind, .. } => *kind,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// Configuration errors abort a batch regardless of `continue`/`rollback`
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Batch context, if any
    pub fn context(&self) -> Option<&Value> {
        match self {
            ResourceError::Batch { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Same class and context, new message
    pub fn with_message(self, message: impl Into<String>) -> Self {
        let message = message.into();
        match self {
            ResourceError::BadRequest(_) => ResourceError::BadRequest(message),
            ResourceError::Forbidden(_) => ResourceError::Forbidden(message),
            ResourceError::NotFound(_) => ResourceError::NotFound(message),
            ResourceError::Configuration(_) => ResourceError::Configuration(message),
            ResourceError::Driver(_) => ResourceError::Driver(message),
            ResourceError::Batch { kind, context, .. } => ResourceError::Batch {
                kind,
                message,
                context,
            },
        }
    }

    /// Rewrap as a batch error, keeping the original class
    pub fn into_batch(self, message: impl Into<String>, context: Value) -> Self {
        ResourceError::Batch {
            kind: self.kind(),
            message: message.into(),
            context,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl From<ResourceError> for ErrorResponse {
    fn from(err: ResourceError) -> Self {
        Self {
            error: ErrorBody {
                code: err.status_code().as_u16(),
                message: err.to_string(),
                context: err.context().cloned(),
            },
        }
    }
}

impl IntoResponse for ResourceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse::from(self));
        (status, body).into_response()
    }
}
