use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::common::error::DomainError;
use serde::Serialize;

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
pub(crate) struct ErrorDetail {
    /// Machine-readable error code (e.g. `STATE_NOT_FOUND`).
    code: &'static str,
    message: String,
}

/// Standard API error type.
///
/// All variants produce a JSON response matching:
/// `{"error":{"code":"SCREAMING_SNAKE","message":"human-readable"}}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound { code: &'static str, message: String },
    BadRequest { code: &'static str, message: String },
    Conflict { code: &'static str, message: String },
    Internal { message: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::Conflict { code, message } => (StatusCode::CONFLICT, code, message),
            Self::Internal { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
            }
        };

        (
            status,
            Json(ErrorBody {
                error: ErrorDetail { code, message },
            }),
        )
            .into_response()
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match &err {
            DomainError::RuleNotFound(_) => Self::NotFound {
                code: "RULE_NOT_FOUND",
                message: err.to_string(),
            },
            DomainError::StateNotFound(_) => Self::NotFound {
                code: "STATE_NOT_FOUND",
                message: err.to_string(),
            },
            DomainError::DuplicateRule(_) => Self::Conflict {
                code: "DUPLICATE_RULE",
                message: err.to_string(),
            },
            DomainError::InvalidRule(_) | DomainError::InvalidConfig(_) => Self::BadRequest {
                code: "VALIDATION_ERROR",
                message: err.to_string(),
            },
            DomainError::EngineError(_) => Self::Internal {
                message: err.to_string(),
            },
        }
    }
}
