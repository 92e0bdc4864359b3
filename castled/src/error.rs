//! Castle daemon error abstractions.

use axum::http::StatusCode;

pub use castle_core::AppError;

/// An extension trait for the core `AppError`.
pub trait AppErrorExt {
    /// Get the HTTP status code for this error.
    fn status_code(&self) -> StatusCode;

    /// Translate the given error into an HTTP status and message.
    fn http(err: anyhow::Error) -> (StatusCode, String);
}

impl AppErrorExt for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn http(err: anyhow::Error) -> (StatusCode, String) {
        let status = err
            .downcast_ref::<AppError>()
            .map(AppError::status_code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, format!("{:#}", err))
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;
