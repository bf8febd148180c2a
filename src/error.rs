use axum::{
    extract::{multipart::MultipartRejection, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced by handlers. Every variant renders as a JSON error body.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    /// Bad credentials on login.
    #[error("Invalid email or password")]
    Unauthorized,
    /// Missing, invalid or expired session.
    #[error("Not authorized")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidOrExpired(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("Email could not be sent")]
    EmailDeliveryFailed,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidOrExpired(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::EmailDeliveryFailed | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message sent to the client. Internal errors never leak their cause.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Something went wrong".to_string(),
            other => other.to_string(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status: &'static str,
    pub status_code: u16,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Self::Internal(e) = &self {
            error!(error = ?e, "unhandled error");
        }
        let body = ErrorBody {
            status: "error",
            status_code: status.as_u16(),
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        warn!(error = %rejection.body_text(), "rejected json body");
        Self::BadRequest("Invalid request body".into())
    }
}

impl From<MultipartRejection> for AppError {
    fn from(rejection: MultipartRejection) -> Self {
        warn!(error = %rejection.body_text(), "rejected multipart body");
        Self::BadRequest("Invalid form data".into())
    }
}

/// Failures reported by the credential store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate email")]
    Duplicate,
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some("23505") => return Self::Duplicate,
                Some("23502") | Some("22001") | Some("23514") => {
                    return Self::Invalid(db.message().to_string())
                }
                _ => {}
            }
        }
        Self::Other(e.into())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate => Self::Conflict("User already exists".into()),
            StoreError::Invalid(_) => Self::BadRequest("Invalid input data".into()),
            StoreError::Other(e) => Self::Internal(e),
        }
    }
}
