//! HTTP error contract: a status code and `{"error": {"code", "message"}}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mailroom_core::Error;
use serde::Serialize;
use tracing::error;

/// An error returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct Body<'a> {
    error: Detail<'a>,
}

#[derive(Serialize)]
struct Detail<'a> {
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    /// 400 with a message.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation_failed",
            message: message.into(),
        }
    }

    /// 401 with a message.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: message.into(),
        }
    }

    /// 500 without leaking the cause.
    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: "internal error".to_string(),
        }
    }

    /// The status code.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => {
                error!(error = %err, "request failed");
                return Self::internal();
            }
        };
        let code = err.code();
        let message = match err {
            Error::Validation(m)
            | Error::Unauthorized(m)
            | Error::Forbidden(m)
            | Error::NotFound(m)
            | Error::Conflict(m) => m,
            other => other.to_string(),
        };
        Self {
            status,
            code,
            message,
        }
    }
}

impl From<mailroom_queue::Error> for ApiError {
    fn from(err: mailroom_queue::Error) -> Self {
        error!(error = %err, "queue request failed");
        Self::internal()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Body {
            error: Detail {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Handler result.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_core_errors() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST, "validation_failed"),
            (Error::Unauthorized("x".into()), StatusCode::UNAUTHORIZED, "unauthorized"),
            (Error::Forbidden("x".into()), StatusCode::FORBIDDEN, "forbidden"),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND, "not_found"),
            (Error::Conflict("x".into()), StatusCode::CONFLICT, "conflict"),
            (
                Error::PasswordHash("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status(), status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn internal_errors_hide_details() {
        let api = ApiError::from(Error::PasswordHash("salt exploded".into()));
        assert_eq!(api.message, "internal error");
    }
}
