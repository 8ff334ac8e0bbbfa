//! Error types for the application core.

use std::net::SocketAddr;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// The server could not bind its listening socket.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An extension rejected its configuration.
    #[error("Extension `{name}` is misconfigured: {message}")]
    MisconfiguredExtension { name: &'static str, message: String },

    /// A route could not be registered.
    #[error("Invalid route {path:?}: {reason}")]
    InvalidRoute { path: String, reason: &'static str },

    /// `listen` was called before `set_settings`.
    #[error("Settings have not been configured")]
    SettingsMissing,

    /// The server is already bound.
    #[error("Server is already listening on {0}")]
    AlreadyListening(SocketAddr),

    /// The server is not bound (never listened, or already closed).
    #[error("Server is not listening")]
    NotListening,

    /// The server handle an extension was bound to no longer exists.
    #[error("Server is no longer available")]
    ServerGone,

    /// No formatter is registered for the requested content type.
    #[error("No formatter registered for content type: {0}")]
    UnsupportedContentType(String),

    /// Graceful shutdown was triggered a second time.
    #[error("Graceful shutdown has already been triggered")]
    ShutdownAlreadyTriggered,

    /// Serialization error.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MisconfiguredExtension { .. } | Self::InvalidRoute { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::UnsupportedContentType(_) => StatusCode::NOT_ACCEPTABLE,
            Self::ServerGone | Self::NotListening | Self::ShutdownAlreadyTriggered => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Bind { .. }
            | Self::SettingsMissing
            | Self::AlreadyListening(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind_failure",
            Self::MisconfiguredExtension { .. } => "misconfigured_extension",
            Self::InvalidRoute { .. } => "invalid_route",
            Self::SettingsMissing => "settings_missing",
            Self::AlreadyListening(_) => "already_listening",
            Self::NotListening => "not_listening",
            Self::ServerGone => "server_gone",
            Self::UnsupportedContentType(_) => "unsupported_content_type",
            Self::ShutdownAlreadyTriggered => "shutdown_already_triggered",
            Self::Serialization(_) => "serialization_error",
            Self::Io(_) => "io_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Build a [`AppError::MisconfiguredExtension`] for `name`.
    pub fn misconfigured(name: &'static str, message: impl Into<String>) -> Self {
        Self::MisconfiguredExtension {
            name,
            message: message.into(),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type.
    pub error: ErrorDetail,
}

/// Error detail.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for the application core.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::UnsupportedContentType("text/csv".into()).status_code(),
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(
            AppError::NotListening.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::misconfigured("cors", "bad").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes() {
        let bind = AppError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.error_code(), "bind_failure");
        assert!(bind.to_string().starts_with("Failed to bind 127.0.0.1:80"));
        assert_eq!(
            AppError::misconfigured("cors", "origins must be strings").to_string(),
            "Extension `cors` is misconfigured: origins must be strings"
        );
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = AppError::NotListening.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "not_listening");
    }
}
