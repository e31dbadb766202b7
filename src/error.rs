use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;

/// Request-scoped failure returned by handlers, interceptors and services.
///
/// Never terminates the process; the dispatcher renders it into the
/// response envelope.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::Json(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Database(_) | ApiError::InternalServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_api_error(err: &ApiError) -> Self {
        let code = err.status().as_u16();
        match err {
            ApiError::InvalidRequest(msg) => Self::new("bad_request", msg, code),
            ApiError::Unauthorized(msg) => Self::new("unauthorized", msg, code),
            ApiError::Forbidden(msg) => Self::new("forbidden", msg, code),
            ApiError::NotFound(msg) => Self::new("not_found", msg, code),
            ApiError::ValidationError(msg) => Self::new("validation_error", msg, code),
            ApiError::Json(e) => Self::new("bad_request", &e.to_string(), code),
            ApiError::Database(e) => Self::new("database_error", &e.to_string(), code),
            ApiError::InternalServerError(msg) => Self::new("internal_error", msg, code),
        }
    }
}

/// Startup failure while validating registered routes and interceptors.
///
/// Fatal: the binary logs it and exits with a non-zero status before
/// serving any request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistrationError {
    #[error("{type_name} lacks the {capability} capability (no base slot declared)")]
    MissingCapability {
        type_name: &'static str,
        capability: &'static str,
    },
    #[error("{type_name} declares slot `{slot}` more than once")]
    DuplicateSlot {
        type_name: &'static str,
        slot: &'static str,
    },
    #[error("{type_name} cannot declare a {kind} slot (`{slot}`)")]
    SlotNotAllowed {
        type_name: &'static str,
        kind: &'static str,
        slot: &'static str,
    },
    #[error("service reference cycle: {0}")]
    CyclicService(String),
    #[error("route {method} {path} is registered twice")]
    DuplicateRoute { method: String, path: String },
    #[error("unsupported http method `{0}`")]
    InvalidMethod(String),
    #[error("path pattern `{0}` must start with `/`")]
    InvalidPath(String),
}
