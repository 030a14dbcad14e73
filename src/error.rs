//! Error types for every layer, and the one place they become HTTP.
//!
//! Components return their own `thiserror` enums. Handlers convert them
//! into [`ApiError`], whose `IntoResponse` picks a fixed status and a
//! user-safe message. The full internal message rides along in an
//! [`ErrorDetail`] response extension so the outer middleware can log it
//! (and show it when debug output is enabled).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET_KEY is not set")]
    MissingSecret,

    #[error("JWT_SECRET_KEY must be at least {min} bytes")]
    WeakSecret { min: usize },

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("secure randomness unavailable: {0}")]
    Randomness(String),

    #[error("malformed password hash: {0}")]
    Format(String),

    #[error("password hashing failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authorization header is missing")]
    MissingHeader,

    #[error("authorization header is not a bearer credential")]
    MalformedScheme,

    #[error("token signature is invalid")]
    BadSignature,

    #[error("token has expired")]
    Expired,

    #[error("token signing algorithm is not allowed")]
    UnsupportedAlgorithm,

    #[error("token signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("row codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("{0}")]
    Conflict(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("course {0} not found")]
    CourseNotFound(u64),

    #[error("ticket {given} is not the open ticket for this customer and course")]
    TicketMismatch { given: u64 },

    #[error("ledger persistence failed: {0}")]
    Persistence(#[from] StorageError),

    #[error("ledger task did not complete: {0}")]
    Interrupted(String),
}

/// Internal error text attached to error responses.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

/// Boundary error for HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Login failure. Deliberately the same for unknown email and bad password.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("insufficient role")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Hashing(#[from] HashError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(msg) => ApiError::Conflict(msg),
            StorageError::NotFound { entity, id } => ApiError::NotFound(format!("{entity} {id}")),
            other => ApiError::Storage(other),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::CourseNotFound(id) => ApiError::NotFound(format!("course {id}")),
            LedgerError::TicketMismatch { .. } => ApiError::Input(err.to_string()),
            LedgerError::Persistence(e) => ApiError::Storage(e),
            LedgerError::Interrupted(msg) => ApiError::Task(msg),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Task(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Input(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Storage(_)
            | ApiError::Hashing(_)
            | ApiError::Config(_)
            | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Input(_) => "BAD_REQUEST",
            ApiError::Auth(_) | ApiError::InvalidCredentials => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            _ => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Message safe to show any caller.
    fn public_message(&self) -> String {
        match self {
            ApiError::Input(msg) => msg.clone(),
            ApiError::Auth(AuthError::Expired) => "token has expired".to_string(),
            ApiError::Auth(_) => "authentication required".to_string(),
            ApiError::InvalidCredentials => "invalid email or password".to_string(),
            ApiError::Forbidden => "insufficient permissions".to_string(),
            ApiError::NotFound(what) => format!("{what} not found"),
            ApiError::Conflict(msg) => msg.clone(),
            _ => "an unexpected error occurred".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            error: self.public_message(),
        };
        let mut response = (self.status(), Json(body)).into_response();
        response
            .extensions_mut()
            .insert(ErrorDetail(self.to_string()));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_fixed_statuses() {
        assert_eq!(ApiError::Input("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Auth(AuthError::Expired).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::from(LedgerError::CourseNotFound(9)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(HashError::Randomness("gone".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_stays_out_of_public_message() {
        let err = ApiError::from(StorageError::Codec(
            serde_json::from_str::<u64>("oops").unwrap_err(),
        ));
        let public = err.public_message();
        assert_eq!(public, "an unexpected error occurred");
        assert!(err.to_string().contains("codec"));
    }

    #[test]
    fn response_carries_detail_extension() {
        let response = ApiError::Conflict("email already registered".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let detail = response.extensions().get::<ErrorDetail>().unwrap();
        assert_eq!(detail.0, "email already registered");
    }
}
