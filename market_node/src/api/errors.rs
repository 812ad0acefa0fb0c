//! API error handling for the marketplace node

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::rate_limiter::RateLimitError;
use crate::market::MarketError;
use crate::payment::PaymentError;
use crate::policy::SessionError;
use crate::storage::StorageError;

/// JSON error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: u64,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: u16, message: String) -> Self {
        Self {
            code,
            message,
            details: None,
            timestamp: chrono::Utc::now().timestamp() as u64,
            request_id: None,
        }
    }

    pub fn with_details(code: u16, message: String, details: serde_json::Value) -> Self {
        Self {
            details: Some(details),
            ..Self::new(code, message)
        }
    }

    // Common error constructors
    pub fn bad_request(message: &str) -> Self {
        Self::new(400, message.to_string())
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::new(401, message.to_string())
    }

    pub fn payment_required(reason: &str) -> Self {
        Self::with_details(
            402,
            "Payment required".to_string(),
            serde_json::json!({ "reason": reason }),
        )
    }

    pub fn forbidden(message: &str) -> Self {
        Self::new(403, message.to_string())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(404, message.to_string())
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(409, message.to_string())
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::with_details(
            413,
            "Payload too large".to_string(),
            serde_json::json!({ "limit_bytes": limit }),
        )
    }

    pub fn internal_server_error(message: &str) -> Self {
        Self::new(500, message.to_string())
    }

    pub fn service_unavailable(message: &str) -> Self {
        Self::new(503, message.to_string())
    }

    pub fn rate_limit_exceeded(limit: u32, window: u64) -> Self {
        Self::with_details(
            429,
            "Rate limit exceeded".to_string(),
            serde_json::json!({
                "limit": limit,
                "window_seconds": window,
                "retry_after": window
            }),
        )
    }

    pub fn validation_error(field: &str, reason: &str) -> Self {
        Self::with_details(
            422,
            "Validation error".to_string(),
            serde_json::json!({
                "field": field,
                "reason": reason
            }),
        )
    }

    pub fn invalid_transition(from: &str, action: &str, reason: &str) -> Self {
        Self::with_details(
            409,
            "Invalid status transition".to_string(),
            serde_json::json!({
                "from": from,
                "action": action,
                "reason": reason
            }),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        use crate::market::order_lifecycle::TransitionError;

        match err {
            MarketError::NotFound { .. } => Self::not_found(&err.to_string()),
            MarketError::Forbidden(msg) => Self::forbidden(&msg),
            MarketError::Validation { field, reason } => Self::validation_error(field, &reason),
            MarketError::InvalidTransition(e) => match e {
                TransitionError::NotPermitted { .. } => Self::forbidden(&e.to_string()),
                TransitionError::InvalidState { from, action } => {
                    Self::invalid_transition(from.as_str(), action.as_str(), &e.to_string())
                }
            },
            MarketError::Conflict(msg) => Self::conflict(&msg),
            MarketError::PaymentRequired(reason) => Self::payment_required(&reason),
            MarketError::Storage(e) => {
                log::error!("Storage failure: {}", e);
                Self::internal_server_error("storage failure")
            }
            MarketError::Payment(e) => Self::from(e),
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Rpc(reason) => {
                log::warn!("Chain RPC failure: {}", reason);
                Self::service_unavailable("payment network unavailable")
            }
            other => Self::payment_required(&other.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self::from(MarketError::from(err))
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::unauthorized(&err.to_string())
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        Self::rate_limit_exceeded(err.limit, err.window.as_secs().max(1))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(&rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(&rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(&rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::order_lifecycle::{OrderAction, TransitionError};
    use crate::market::OrderStatus;

    #[test]
    fn market_errors_map_to_status_codes() {
        let cases = [
            (MarketError::not_found("order", 1), 404),
            (MarketError::Forbidden("no".into()), 403),
            (MarketError::validation("title", "empty"), 422),
            (MarketError::Conflict("version".into()), 409),
            (MarketError::PaymentRequired("unpaid".into()), 402),
            (
                MarketError::InvalidTransition(TransitionError::InvalidState {
                    from: OrderStatus::Completed,
                    action: OrderAction::Accept,
                }),
                409,
            ),
            (MarketError::Storage(StorageError::ReadError("disk".into())), 500),
            (MarketError::Payment(PaymentError::Rpc("down".into())), 503),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError::from(err).code, code);
        }
    }

    #[test]
    fn storage_failures_hide_details() {
        let api = ApiError::from(MarketError::Storage(StorageError::ReadError("/var/db".into())));
        assert!(!api.message.contains("/var/db"));
    }

    #[test]
    fn validation_error_carries_field() {
        let api = ApiError::from(MarketError::validation("price", "cannot be negative"));
        let details = api.details.unwrap();
        assert_eq!(details["field"], "price");
        assert_eq!(details["reason"], "cannot be negative");
    }
}
