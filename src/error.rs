//! HTTP error taxonomy.
//!
//! Every handler failure funnels into [`ApiError`], which renders the
//! uniform envelope `{error, message, details?}` with the status mapping of
//! the protocol: validation and parse problems are 400s, payment problems
//! are 402s, the limiter is 429, funding problems 503, and chain failures
//! surface as `TX_*` codes — 400 for reverts, 500 otherwise.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::chain::{ChainError, ChainErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("Forwarder rejected the request signature")]
    InvalidSignature,
    #[error("Payment header could not be parsed")]
    InvalidPayment,
    #[error("Payment verification failed: {reason}")]
    PaymentInvalid { reason: String },
    #[error("Payment settlement failed: {detail}")]
    PaymentFailed { detail: String },
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("Relayer lacks native balance: {detail}")]
    InsufficientFunds { detail: String },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidSignature | ApiError::InvalidPayment => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PaymentInvalid { .. } | ApiError::PaymentFailed { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InsufficientFunds { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Chain(error) => match error.kind {
                ChainErrorKind::Revert => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::InvalidSignature => "INVALID_SIGNATURE",
            ApiError::InvalidPayment => "INVALID_PAYMENT",
            ApiError::PaymentInvalid { .. } => "PAYMENT_INVALID",
            ApiError::PaymentFailed { .. } => "PAYMENT_FAILED",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            ApiError::Chain(error) => error.kind.code(),
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The response body. Kept separate from `into_response` so tests can
    /// inspect the envelope without running an axum service.
    ///
    /// The limiter's 429 is the one variant outside the uniform envelope:
    /// its body is exactly `{error, retryAfter}`.
    pub fn body(&self) -> serde_json::Value {
        if let ApiError::RateLimited { retry_after } = self {
            return json!({
                "error": self.code(),
                "retryAfter": retry_after,
            });
        }
        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        match self {
            ApiError::PaymentInvalid { reason } => {
                body["details"] = json!({ "reason": reason });
            }
            ApiError::Chain(error) => {
                body["details"] = json!({
                    "kind": error.kind.to_string(),
                    "retriable": error.retriable,
                });
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::InvalidSignature.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidPayment.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::PaymentInvalid {
                reason: "expired".into()
            }
            .status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::PaymentFailed {
                detail: "reverted".into()
            }
            .status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::RateLimited { retry_after: 30 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::InsufficientFunds {
                detail: "0.5".into()
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn chain_errors_split_on_revert() {
        let revert = ApiError::Chain(ChainError::new(ChainErrorKind::Revert, "reverted"));
        assert_eq!(revert.status(), StatusCode::BAD_REQUEST);
        assert_eq!(revert.code(), "TX_REVERT");

        let nonce = ApiError::Chain(ChainError::new(ChainErrorKind::NonceTooLow, "nonce too low"));
        assert_eq!(nonce.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(nonce.code(), "TX_NONCE_TOO_LOW");
    }

    #[test]
    fn rate_limited_body_is_the_bare_pair() {
        let body = ApiError::RateLimited { retry_after: 42 }.body();
        assert_eq!(body["error"], "RATE_LIMITED");
        assert_eq!(body["retryAfter"], 42);
        assert!(body.get("message").is_none());
        assert_eq!(body.as_object().unwrap().len(), 2);
    }

    #[test]
    fn payment_invalid_body_carries_reason() {
        let body = ApiError::PaymentInvalid {
            reason: "Authorization expired: validBefore 10".into(),
        }
        .body();
        assert_eq!(body["error"], "PAYMENT_INVALID");
        assert!(
            body["details"]["reason"]
                .as_str()
                .unwrap()
                .contains("expired")
        );
    }
}
