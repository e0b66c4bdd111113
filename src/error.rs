//! # Error Handling
//!
//! HTTP-facing error type and its mapping onto responses.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: one per HTTP outcome the gateway can produce
//! - **Pattern matching**: `error_response` maps each variant to a status
//!
//! ### Traits for Error Conversion
//! - **From trait**: lets handlers use `?` on recognition results directly
//! - **ResponseError trait**: turns the error into a JSON HTTP response
//!
//! ## Status Mapping for Recognition Failures:
//! - invalid input (bad container, missing token, empty audio) → 400
//! - provider too slow → 504
//! - provider unreachable or failing → 502

use crate::transcription::AsrError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **BadGateway**: The speech provider failed (502)
/// - **GatewayTimeout**: The speech provider did not answer in time (504)
#[derive(Debug)]
pub enum AppError {
    Internal(String),

    BadRequest(String),

    BadGateway(String),

    GatewayTimeout(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::BadGateway(msg) => write!(f, "Upstream error: {}", msg),
            AppError::GatewayTimeout(msg) => write!(f, "Upstream timeout: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::BadGateway(msg) => ("bad_gateway", msg),
            AppError::GatewayTimeout(msg) => ("gateway_timeout", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<AsrError> for AppError {
    fn from(err: AsrError) -> Self {
        if err.is_input_error() {
            AppError::BadRequest(err.to_string())
        } else if err.is_timeout() {
            AppError::GatewayTimeout(err.to_string())
        } else {
            AppError::BadGateway(err.to_string())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
