//! API error taxonomy and HTTP mapping.
//!
//! Every failure that can cross the API boundary is an [`AppError`]. The
//! `IntoResponse` impl renders the wire envelope
//! `{ error, errorCode?, details?, retryAfter? }` and the status mapping.
//! Database failures are logged and surfaced opaque; stack traces never
//! reach a response body.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

use crate::ratelimit::Decision;

/// Wire error codes.
pub mod codes {
    pub const POLL_INACTIVE: &str = "POLL_INACTIVE";
    pub const POLL_EXPIRED: &str = "POLL_EXPIRED";
    pub const ALREADY_VOTED: &str = "ALREADY_VOTED";
    pub const DUPLICATE_EMAIL_VOTE: &str = "DUPLICATE_EMAIL_VOTE";
    pub const SLOT_FULL: &str = "SLOT_FULL";
    pub const ALREADY_SIGNED_UP: &str = "ALREADY_SIGNED_UP";
    pub const REQUIRES_LOGIN: &str = "REQUIRES_LOGIN";
    pub const EMAIL_BELONGS_TO_ANOTHER_USER: &str = "EMAIL_BELONGS_TO_ANOTHER_USER";
    pub const WITHDRAWAL_NOT_ALLOWED: &str = "WITHDRAWAL_NOT_ALLOWED";
    pub const NO_VOTES_FOUND: &str = "NO_VOTES_FOUND";
    pub const REMINDER_LIMIT_REACHED: &str = "REMINDER_LIMIT_REACHED";
    pub const REMINDER_TOO_SOON: &str = "REMINDER_TOO_SOON";
}

/// All errors the API surface can return.
#[derive(Debug, Error)]
pub enum AppError {
    /// 400 with optional machine-readable code and details.
    #[error("{message}")]
    BadRequest {
        message: String,
        code: Option<&'static str>,
        details: Option<Value>,
    },

    /// 401; `requiresAuth` tells front-ends to open the login flow.
    #[error("authentication required")]
    Authentication,

    /// 403; `results_private` marks the result-visibility variant.
    #[error("{message}")]
    Authorization {
        message: String,
        code: Option<&'static str>,
        results_private: bool,
    },

    /// 404 with an opaque resource label ("Poll not found").
    #[error("{0} not found")]
    NotFound(&'static str),

    /// 404 with a machine-readable code (NO_VOTES_FOUND).
    #[error("{message}")]
    NotFoundCode {
        message: String,
        code: &'static str,
    },

    /// 409.
    #[error("{message}")]
    Conflict {
        message: String,
        code: Option<&'static str>,
    },

    /// 429 with Retry-After and X-RateLimit-* headers.
    #[error("rate limit exceeded")]
    RateLimited(Decision),

    /// 503; an optional external collaborator is down.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// 500; logged in full, surfaced opaque.
    #[error("database error")]
    Database(#[from] sqlx::Error),

    /// 500; logged in full, surfaced opaque.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::BadRequest {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        AppError::BadRequest {
            message: message.into(),
            code: Some(code),
            details: None,
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Conflict {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        AppError::Authorization {
            message: message.into(),
            code: None,
            results_private: false,
        }
    }

    pub fn forbidden_code(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Authorization {
            message: message.into(),
            code: Some(code),
            results_private: false,
        }
    }

    pub fn results_private() -> Self {
        AppError::Authorization {
            message: "results are private".into(),
            code: None,
            results_private: true,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::Authentication => StatusCode::UNAUTHORIZED,
            AppError::Authorization { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::NotFoundCode { .. } => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::BadRequest {
            message: "validation failed".into(),
            code: None,
            details: serde_json::to_value(&errors).ok(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let body = match &self {
            AppError::BadRequest {
                message,
                code,
                details,
            } => {
                let mut body = json!({ "error": message });
                if let Some(code) = code {
                    body["errorCode"] = json!(code);
                }
                if let Some(details) = details {
                    body["details"] = details.clone();
                }
                body
            }
            AppError::Authentication => {
                json!({ "error": "authentication required", "requiresAuth": true })
            }
            AppError::Authorization {
                message,
                code,
                results_private,
            } => {
                let mut body = json!({ "error": message });
                if let Some(code) = code {
                    body["errorCode"] = json!(code);
                }
                if *results_private {
                    body["resultsPrivate"] = json!(true);
                }
                body
            }
            AppError::NotFound(what) => json!({ "error": format!("{} not found", what) }),
            AppError::NotFoundCode { message, code } => {
                json!({ "error": message, "errorCode": code })
            }
            AppError::Conflict { message, code } => {
                let mut body = json!({ "error": message });
                if let Some(code) = code {
                    body["errorCode"] = json!(code);
                }
                body
            }
            AppError::RateLimited(decision) => {
                let retry_after = decision.retry_after_secs.unwrap_or(1);
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from_str(&retry_after.to_string())
                        .unwrap_or(HeaderValue::from_static("1")),
                );
                insert_rate_headers(&mut headers, decision);
                json!({ "error": "rate limit exceeded", "retryAfter": retry_after })
            }
            AppError::ServiceUnavailable(what) => {
                json!({ "error": format!("service unavailable: {}", what) })
            }
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                json!({ "error": "internal server error" })
            }
            AppError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                json!({ "error": "internal server error" })
            }
        };

        (status, headers, Json(body)).into_response()
    }
}

/// `X-RateLimit-Limit` / `-Remaining` / `-Reset` headers for a decision.
pub fn insert_rate_headers(headers: &mut HeaderMap, decision: &Decision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}
